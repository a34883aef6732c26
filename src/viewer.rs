//! Viewer lifecycle: join, leave, owner vs. guest, input routing.
//!
//! The first viewer to join becomes the *owner*: its settings configure the
//! upstream connection and its join spawns the session task. Every later
//! viewer attaches as a *guest*, is replayed the current display content, and
//! shares the same session. Any viewer whose own settings say `read-only`
//! keeps no input path at all; its event methods are inert.

use std::sync::Arc;

use log::{debug, info, warn};
use tokio::sync::RwLock;

use crate::display::SharedDisplay;
use crate::error::Result;
use crate::session::Session;
use crate::settings::Settings;
use crate::wire::{ViewerSocket, WireCommand};

/// How a viewer relates to the session it is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewerRole {
    /// First joiner; owns the upstream connection lifecycle.
    Owner,
    /// Later joiner sharing the owner's session.
    Guest,
}

/// One bridged upstream connection and the viewers attached to it.
pub struct Bridge {
    display: Arc<SharedDisplay>,
    session: RwLock<Option<Arc<Session>>>,
}

impl Default for Bridge {
    fn default() -> Self {
        Self::new()
    }
}

impl Bridge {
    /// Creates a bridge with no session yet; the session starts when the
    /// owner joins.
    #[must_use]
    pub fn new() -> Self {
        Self {
            display: Arc::new(SharedDisplay::new()),
            session: RwLock::new(None),
        }
    }

    /// Attaches a viewer.
    ///
    /// `socket` is the command channel the gateway runtime drains onto the
    /// viewer's downstream connection. The first successful join spawns the
    /// session task using that viewer's settings; later joins attach to the
    /// running session and are replayed the current display content.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Config`](crate::BridgeError::Config) when the
    /// arguments do not parse; the viewer is rejected and nothing is
    /// attached.
    pub async fn join(&self, id: u64, socket: ViewerSocket, args: &[(&str, &str)]) -> Result<Viewer> {
        let settings = Settings::from_args(args).map_err(|e| {
            warn!("Rejecting viewer {id}: {e}");
            e
        })?;

        let mut slot = self.session.write().await;
        let (role, session) = match slot.as_ref() {
            None => {
                let session = Session::new(settings.clone(), self.display.clone());
                *slot = Some(session.clone());
                tokio::spawn(session.clone().run());
                info!("Viewer {id} joined as owner, session starting");
                (ViewerRole::Owner, session)
            }
            Some(session) => {
                info!("Viewer {id} joined as guest");
                (ViewerRole::Guest, session.clone())
            }
        };
        drop(slot);

        self.display.attach(id, socket.clone()).await;

        if role == ViewerRole::Guest {
            // Replay what the display shows right now. Before the upstream
            // handshake has allocated the surface there is nothing to replay;
            // the first flush after allocation carries the full frame anyway.
            if !self.display.dup_to(&socket).await {
                debug!("Viewer {id}: display not initialised yet, skipping replay");
            }
            if let Some(text) = session.latest_clipboard() {
                let _ = socket.send(WireCommand::Clipboard { text });
            }
        }

        Ok(Viewer {
            id,
            role,
            read_only: settings.read_only,
            settings,
            session,
            display: self.display.clone(),
        })
    }

    /// Detaches a viewer, removing its cursor contribution.
    ///
    /// The session keeps running without the owner; it ends through
    /// [`Bridge::stop`], a fatal upstream error, or an explicit abort. The
    /// owner's settings belong to the session and are freed with it; a
    /// guest's settings drop here with the viewer.
    pub async fn leave(&self, viewer: Viewer) {
        self.display.detach(viewer.id).await;
        info!("Viewer {} left", viewer.id);
    }

    /// Requests session shutdown. The session task observes the flag at its
    /// next frame boundary.
    pub async fn stop(&self) {
        if let Some(session) = self.session.read().await.as_ref() {
            session.stop();
        }
    }

    /// Reports how far downstream viewers are behind, in milliseconds. The
    /// session loop uses this to stretch frames under load.
    pub async fn set_processing_lag(&self, lag_ms: u64) {
        if let Some(session) = self.session.read().await.as_ref() {
            session.set_processing_lag(lag_ms);
        }
    }

    /// The display shared by all viewers of this bridge.
    #[must_use]
    pub fn display(&self) -> &Arc<SharedDisplay> {
        &self.display
    }
}

/// One attached end user.
pub struct Viewer {
    id: u64,
    role: ViewerRole,
    read_only: bool,
    settings: Settings,
    session: Arc<Session>,
    display: Arc<SharedDisplay>,
}

impl Viewer {
    /// Identifier the viewer joined with.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Owner or guest.
    #[must_use]
    pub fn role(&self) -> ViewerRole {
        self.role
    }

    /// Whether this viewer's input is suppressed.
    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// This viewer's parsed settings.
    #[must_use]
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Routes a mouse event: updates the shared cursor and forwards the
    /// event upstream. Inert for read-only viewers; silently dropped while
    /// the upstream connection is still being established.
    pub fn mouse(&self, x: u16, y: u16, button_mask: u8) {
        if self.read_only {
            return;
        }
        self.display
            .cursor_update(self.id, i32::from(x), i32::from(y), button_mask);
        self.session.send_pointer(x, y, button_mask);
    }

    /// Routes a key event upstream. Inert for read-only viewers.
    pub fn key(&self, keysym: u32, pressed: bool) {
        if self.read_only {
            return;
        }
        self.session.send_key(keysym, pressed);
    }

    /// Routes viewer clipboard text (UTF-8) upstream through the clipboard
    /// codec. Inert for read-only viewers.
    pub fn clipboard(&self, text: &str) {
        if self.read_only {
            return;
        }
        self.session.send_clipboard(text);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::viewer_channel;
    use tokio::sync::mpsc::UnboundedReceiver;

    // An address that blackholes the connect attempt, keeping the spawned
    // session harmlessly parked during the test.
    const UNROUTABLE: &[(&str, &str)] = &[("hostname", "10.255.255.1")];

    fn drain(rx: &mut UnboundedReceiver<WireCommand>) -> Vec<WireCommand> {
        let mut out = Vec::new();
        while let Ok(cmd) = rx.try_recv() {
            out.push(cmd);
        }
        out
    }

    #[tokio::test]
    async fn test_first_join_is_owner_then_guests() {
        let bridge = Bridge::new();
        let (owner_tx, _owner_rx) = viewer_channel();
        let owner = bridge.join(1, owner_tx, UNROUTABLE).await.unwrap();
        assert_eq!(owner.role(), ViewerRole::Owner);

        let (guest_tx, _guest_rx) = viewer_channel();
        let guest = bridge.join(2, guest_tx, UNROUTABLE).await.unwrap();
        assert_eq!(guest.role(), ViewerRole::Guest);
    }

    #[tokio::test]
    async fn test_bad_arguments_reject_viewer() {
        let bridge = Bridge::new();
        let (tx, _rx) = viewer_channel();
        assert!(bridge.join(1, tx, &[("port", "5900")]).await.is_err());
        // The failed join must not have claimed the owner slot.
        assert!(bridge.session.read().await.is_none());
    }

    #[tokio::test]
    async fn test_guest_join_before_display_allocation_is_safe() {
        let bridge = Bridge::new();
        let (owner_tx, _owner_rx) = viewer_channel();
        bridge.join(1, owner_tx, UNROUTABLE).await.unwrap();

        let (guest_tx, mut guest_rx) = viewer_channel();
        let guest = bridge.join(2, guest_tx, UNROUTABLE).await.unwrap();
        assert_eq!(guest.role(), ViewerRole::Guest);
        // No replay happened, and nothing crashed.
        assert!(drain(&mut guest_rx).is_empty());
    }

    #[tokio::test]
    async fn test_guest_is_replayed_existing_content() {
        let bridge = Bridge::new();
        let (owner_tx, _owner_rx) = viewer_channel();
        bridge.join(1, owner_tx, UNROUTABLE).await.unwrap();
        bridge.display().allocate(16, 16).await;
        bridge.display().surface_flush().await;

        let (guest_tx, mut guest_rx) = viewer_channel();
        bridge.join(2, guest_tx, UNROUTABLE).await.unwrap();
        let commands = drain(&mut guest_rx);
        assert!(matches!(commands[0], WireCommand::Resize { width: 16, height: 16 }));
        assert!(matches!(commands[1], WireCommand::Draw { .. }));
        assert!(commands.iter().any(|c| matches!(c, WireCommand::EndFrame)));
    }

    #[tokio::test]
    async fn test_read_only_viewer_input_is_inert() {
        let bridge = Bridge::new();
        let (owner_tx, _owner_rx) = viewer_channel();
        bridge.join(1, owner_tx, UNROUTABLE).await.unwrap();

        let (guest_tx, _guest_rx) = viewer_channel();
        let guest = bridge
            .join(
                2,
                guest_tx,
                &[("hostname", "10.255.255.1"), ("read-only", "true")],
            )
            .await
            .unwrap();
        assert!(guest.is_read_only());

        guest.mouse(50, 60, 1);
        guest.key(0x0041, true);
        guest.clipboard("nope");
        // The shared cursor never saw the read-only viewer.
        let (_, _, _, owner) = bridge.display().cursor_position();
        assert_eq!(owner, None);
    }

    #[tokio::test]
    async fn test_mouse_updates_shared_cursor() {
        let bridge = Bridge::new();
        let (tx, _rx) = viewer_channel();
        let viewer = bridge.join(7, tx, UNROUTABLE).await.unwrap();

        viewer.mouse(120, 80, 1);
        assert_eq!(bridge.display().cursor_position(), (120, 80, 1, Some(7)));

        bridge.leave(viewer).await;
        let (_, _, mask, owner) = bridge.display().cursor_position();
        assert_eq!(mask, 0);
        assert_eq!(owner, None);
    }
}
