//! Post-receive hook script generation.
//!
//! The script is a pure function of the advertised API address, the API port
//! and the repository path, so re-deriving it at startup and comparing bytes
//! against the installed copy detects configuration drift.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};

/// Name of the hook inside a bare repository's `hooks/` directory.
pub const POST_RECEIVE: &str = "post-receive";

/// Bytes escaped inside one URL path segment.
const SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'\'')
    .add(b'/')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'[')
    .add(b'\\')
    .add(b']')
    .add(b'^')
    .add(b'`')
    .add(b'{')
    .add(b'|')
    .add(b'}');

/// Build the post-receive script for the repository at `repo_path` (rooted,
/// e.g. `/team/app`) that notifies the gateway at `address:port`.
///
/// For every `<old> <new> <ref>` line git feeds the hook, the script POSTs
/// the new revision to `/hook<repo_path>` and echoes the response so it shows
/// up in the pusher's terminal.  Path segments are percent-encoded; the
/// control plane decodes them back.
pub fn post_receive_script(address: &str, port: u16, repo_path: &str) -> Vec<u8> {
    let url = format!(
        "http://{}:{port}/hook{}",
        reachable_host(address),
        encode_path(repo_path)
    );

    format!(
        "#!/bin/sh\n\
         while read oldrev newrev refname; do\n  \
         curl -sS -d \"${{newrev}}\" {}\n  \
         echo\n\
         done\n",
        single_quote(&url),
    )
    .into_bytes()
}

/// Rewrite a bind-all address to loopback and bracket IPv6 literals.
///
/// The hook runs on this host, so a wildcard bind address is never a valid
/// destination for it.
fn reachable_host(address: &str) -> String {
    let trimmed = address.trim_start_matches('[').trim_end_matches(']');
    match trimmed.parse::<IpAddr>() {
        Ok(IpAddr::V4(v4)) if v4.is_unspecified() => Ipv4Addr::LOCALHOST.to_string(),
        Ok(IpAddr::V6(v6)) if v6.is_unspecified() => format!("[{}]", Ipv6Addr::LOCALHOST),
        Ok(IpAddr::V6(v6)) => format!("[{v6}]"),
        _ => address.to_string(),
    }
}

/// Percent-encode each `/`-separated segment of a rooted path.
fn encode_path(path: &str) -> String {
    path.split('/')
        .map(|segment| utf8_percent_encode(segment, SEGMENT).to_string())
        .collect::<Vec<_>>()
        .join("/")
}

/// Quote `s` for a POSIX shell.
fn single_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_inputs_give_identical_bytes() {
        let a = post_receive_script("10.0.0.5", 3776, "/team/app");
        let b = post_receive_script("10.0.0.5", 3776, "/team/app");
        assert_eq!(a, b);
    }

    #[test]
    fn script_targets_hook_endpoint() {
        let script = String::from_utf8(post_receive_script("10.0.0.5", 3776, "/a")).unwrap();
        assert!(script.starts_with("#!/bin/sh\n"));
        assert!(script.contains("while read oldrev newrev refname; do"));
        assert!(script.contains("curl -sS -d \"${newrev}\" 'http://10.0.0.5:3776/hook/a'"));
    }

    #[test]
    fn wildcard_v4_becomes_loopback() {
        let script = String::from_utf8(post_receive_script("0.0.0.0", 80, "/a")).unwrap();
        assert!(script.contains("'http://127.0.0.1:80/hook/a'"));
    }

    #[test]
    fn wildcard_v6_becomes_bracketed_loopback() {
        let script = String::from_utf8(post_receive_script("::", 80, "/a")).unwrap();
        assert!(script.contains("'http://[::1]:80/hook/a'"));
    }

    #[test]
    fn v6_literal_is_bracketed_once() {
        assert_eq!(reachable_host("fd00::1"), "[fd00::1]");
        assert_eq!(reachable_host("[fd00::1]"), "[fd00::1]");
    }

    #[test]
    fn hostnames_pass_through() {
        assert_eq!(reachable_host("gateway.internal"), "gateway.internal");
    }

    #[test]
    fn different_paths_give_different_scripts() {
        assert_ne!(
            post_receive_script("127.0.0.1", 3776, "/a"),
            post_receive_script("127.0.0.1", 3776, "/b"),
        );
    }

    #[test]
    fn path_segments_are_percent_encoded() {
        let script = String::from_utf8(post_receive_script("127.0.0.1", 3776, "/team/a b")).unwrap();
        assert!(script.contains("'http://127.0.0.1:3776/hook/team/a%20b'"));

        assert_eq!(encode_path("/a#1/b?x"), "/a%231/b%3Fx");
        assert_eq!(encode_path("/it's/100%"), "/it%27s/100%25");
        assert_eq!(encode_path("/caf\u{e9}"), "/caf%C3%A9");
        assert_eq!(encode_path("/team/app.git"), "/team/app.git");
    }

    #[test]
    fn quotes_are_escaped() {
        assert_eq!(single_quote("it's"), r"'it'\''s'");
    }
}
