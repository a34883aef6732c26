//! Per-viewer connection settings.
//!
//! The gateway runtime hands each joining viewer's arguments to the bridge as
//! key/value pairs. The owner's settings configure the upstream connection;
//! guests carry their own copy so per-viewer flags such as `read-only` can
//! differ between users of the same session.

use crate::clipboard::ClipboardEncoding;
use crate::error::{BridgeError, Result};

/// Default VNC server port.
const DEFAULT_PORT: u16 = 5900;

/// Default reverse-connect listen timeout in milliseconds.
const DEFAULT_LISTEN_TIMEOUT: u64 = 5000;

/// Parsed per-viewer settings.
#[derive(Debug, Clone)]
pub struct Settings {
    /// VNC server address. Empty only in reverse-connect mode.
    pub hostname: String,
    /// VNC server port.
    pub port: u16,
    /// Authentication password, if the server requires one.
    pub password: Option<String>,
    /// Suppress this viewer's input entirely.
    pub read_only: bool,
    /// Swap the red and blue channels on pixel output.
    pub swap_red_blue: bool,
    /// Requested colour depth: 8, 16, 24 or 32.
    pub color_depth: u8,
    /// Let the server render the cursor into the framebuffer instead of
    /// handling cursor shapes locally.
    pub remote_cursor: bool,
    /// Comma-separated upstream encoding preference list, if given.
    pub encodings: Option<String>,
    /// Clipboard transcoding encoding.
    pub clipboard_encoding: ClipboardEncoding,
    /// Listen for a server-initiated connection instead of dialing out.
    pub reverse_connect: bool,
    /// Port to listen on in reverse-connect mode.
    pub listen_port: u16,
    /// How long to wait for a reverse connection, in milliseconds.
    pub listen_timeout: u64,
    /// VNC repeater destination host, if connecting through a repeater.
    pub dest_host: Option<String>,
    /// VNC repeater destination port.
    pub dest_port: Option<u16>,
    /// Number of times the initial connect is retried before giving up.
    pub retries: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            hostname: String::new(),
            port: DEFAULT_PORT,
            password: None,
            read_only: false,
            swap_red_blue: false,
            color_depth: 32,
            remote_cursor: false,
            encodings: None,
            clipboard_encoding: ClipboardEncoding::default(),
            reverse_connect: false,
            listen_port: DEFAULT_PORT,
            listen_timeout: DEFAULT_LISTEN_TIMEOUT,
            dest_host: None,
            dest_port: None,
            retries: 0,
        }
    }
}

impl Settings {
    /// Parses viewer arguments into settings.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Config`] for unknown keys, malformed values, an
    /// unsupported colour depth, or a missing hostname outside
    /// reverse-connect mode. Join-time policy is log-and-reject with no
    /// retry.
    pub fn from_args(args: &[(&str, &str)]) -> Result<Self> {
        let mut settings = Self::default();

        for &(key, value) in args {
            match key {
                "hostname" => settings.hostname = value.to_string(),
                "port" => settings.port = parse_number(key, value)?,
                "password" => settings.password = Some(value.to_string()),
                "read-only" => settings.read_only = parse_bool(key, value)?,
                "swap-red-blue" => settings.swap_red_blue = parse_bool(key, value)?,
                "color-depth" => settings.color_depth = parse_number(key, value)?,
                "remote-cursor" => settings.remote_cursor = parse_bool(key, value)?,
                "encodings" => settings.encodings = Some(value.to_string()),
                "clipboard-encoding" => {
                    settings.clipboard_encoding = ClipboardEncoding::from_name(Some(value));
                }
                "reverse-connect" => settings.reverse_connect = parse_bool(key, value)?,
                "listen-port" => settings.listen_port = parse_number(key, value)?,
                "listen-timeout" => settings.listen_timeout = parse_number(key, value)?,
                "dest-host" => settings.dest_host = Some(value.to_string()),
                "dest-port" => settings.dest_port = Some(parse_number(key, value)?),
                "retries" => settings.retries = parse_number(key, value)?,
                other => {
                    return Err(BridgeError::Config(format!("unknown parameter \"{other}\"")));
                }
            }
        }

        if !matches!(settings.color_depth, 8 | 16 | 24 | 32) {
            return Err(BridgeError::Config(format!(
                "unsupported color depth {}",
                settings.color_depth
            )));
        }
        if settings.hostname.is_empty() && !settings.reverse_connect {
            return Err(BridgeError::Config("hostname is required".into()));
        }

        Ok(settings)
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value {
        "true" | "1" => Ok(true),
        "false" | "0" | "" => Ok(false),
        other => Err(BridgeError::Config(format!(
            "parameter \"{key}\" expects a boolean, got \"{other}\""
        ))),
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value.parse().map_err(|_| {
        BridgeError::Config(format!("parameter \"{key}\" has invalid value \"{value}\""))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = Settings::from_args(&[("hostname", "vnc.example.net")]).unwrap();
        assert_eq!(settings.port, 5900);
        assert_eq!(settings.color_depth, 32);
        assert_eq!(settings.retries, 0);
        assert_eq!(settings.listen_timeout, 5000);
        assert!(!settings.read_only);
        assert!(settings.password.is_none());
        assert!(settings.clipboard_encoding.is_standard());
    }

    #[test]
    fn test_full_argument_set() {
        let settings = Settings::from_args(&[
            ("hostname", "10.0.0.5"),
            ("port", "5901"),
            ("password", "hunter2"),
            ("read-only", "true"),
            ("swap-red-blue", "true"),
            ("color-depth", "16"),
            ("remote-cursor", "true"),
            ("encodings", "zrle,copyrect,raw"),
            ("clipboard-encoding", "UTF-8"),
            ("dest-host", "10.0.0.99"),
            ("dest-port", "5902"),
            ("retries", "3"),
        ])
        .unwrap();
        assert_eq!(settings.port, 5901);
        assert_eq!(settings.password.as_deref(), Some("hunter2"));
        assert!(settings.read_only);
        assert!(settings.swap_red_blue);
        assert_eq!(settings.color_depth, 16);
        assert_eq!(settings.encodings.as_deref(), Some("zrle,copyrect,raw"));
        assert_eq!(settings.clipboard_encoding, ClipboardEncoding::Utf8);
        assert_eq!(settings.dest_port, Some(5902));
        assert_eq!(settings.retries, 3);
    }

    #[test]
    fn test_reverse_connect_without_hostname() {
        let settings = Settings::from_args(&[
            ("reverse-connect", "true"),
            ("listen-port", "5500"),
            ("listen-timeout", "10000"),
        ])
        .unwrap();
        assert!(settings.reverse_connect);
        assert_eq!(settings.listen_port, 5500);
        assert_eq!(settings.listen_timeout, 10000);
    }

    #[test]
    fn test_missing_hostname_rejected() {
        assert!(Settings::from_args(&[("port", "5900")]).is_err());
    }

    #[test]
    fn test_bad_values_rejected() {
        assert!(Settings::from_args(&[("hostname", "h"), ("port", "70000")]).is_err());
        assert!(Settings::from_args(&[("hostname", "h"), ("color-depth", "15")]).is_err());
        assert!(Settings::from_args(&[("hostname", "h"), ("read-only", "yes")]).is_err());
        assert!(Settings::from_args(&[("hostname", "h"), ("no-such-key", "1")]).is_err());
    }

    #[test]
    fn test_unknown_clipboard_encoding_falls_back() {
        let settings =
            Settings::from_args(&[("hostname", "h"), ("clipboard-encoding", "EBCDIC")]).unwrap();
        assert!(settings.clipboard_encoding.is_standard());
    }
}
