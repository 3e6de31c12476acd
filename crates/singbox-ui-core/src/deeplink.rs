//! Deep-link argument parsing
//!
//! Fresh launches and arguments forwarded over IPC both go through
//! [`parse_args`]. Recognised forms:
//!
//! * `http://…` / `https://…`, imported verbatim
//! * `sing-box://import-remote-profile?url=<encoded>#<name>`
//! * `singbox-ui://import?url=<encoded>&name=<name>`

use percent_encoding::percent_decode_str;
use url::Url;

/// Scheme registered by sing-box clients for remote profiles
pub const SING_BOX_SCHEME: &str = "sing-box";
/// Scheme registered by this application
pub const APP_SCHEME: &str = "singbox-ui";

/// A request carried by a command line argument
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeepLink {
    ImportSubscription { url: String, name: Option<String> },
}

/// Collect the deep links among `args`; everything else is ignored
pub fn parse_args<S: AsRef<str>>(args: &[S]) -> Vec<DeepLink> {
    args.iter().filter_map(|arg| parse_link(arg.as_ref())).collect()
}

/// Parse a single argument
pub fn parse_link(arg: &str) -> Option<DeepLink> {
    let arg = arg.trim();
    if is_http(arg) {
        let url = Url::parse(arg).ok()?;
        return Some(DeepLink::ImportSubscription {
            url: arg.to_string(),
            name: url.fragment().and_then(decode_name),
        });
    }

    let url = Url::parse(arg).ok()?;
    let scheme = url.scheme().to_ascii_lowercase();
    let action = url.host_str().unwrap_or_default().to_ascii_lowercase();

    let (target, name) = match (scheme.as_str(), action.as_str()) {
        (SING_BOX_SCHEME, "import-remote-profile") => {
            (query_value(&url, "url"), url.fragment().and_then(decode_name))
        }
        (APP_SCHEME, "import") => (
            query_value(&url, "url"),
            query_value(&url, "name").filter(|n| !n.trim().is_empty()),
        ),
        _ => {
            tracing::debug!("Ignoring unsupported link {}", arg);
            return None;
        }
    };

    match target {
        Some(target) if is_http(&target) => Some(DeepLink::ImportSubscription { url: target, name }),
        _ => {
            tracing::warn!("Deep link without a usable subscription URL: {}", arg);
            None
        }
    }
}

fn is_http(s: &str) -> bool {
    let lower = s.get(..8).unwrap_or(s).to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

fn query_value(url: &Url, key: &str) -> Option<String> {
    url.query_pairs()
        .find(|(k, _)| k.eq_ignore_ascii_case(key))
        .map(|(_, v)| v.into_owned())
}

/// Percent-decoded, non-empty fragment
fn decode_name(fragment: &str) -> Option<String> {
    let name = percent_decode_str(fragment).decode_utf8_lossy();
    let name = name.trim();
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}
