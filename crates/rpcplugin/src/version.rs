//! Protocol version negotiation.
//!
//! The client advertises the versions it supports through
//! `PLUGIN_PROTOCOL_VERSIONS`; the server picks the greatest version both
//! peers have in common. The choice is deterministic: both sides always
//! arrive at `max(client ∩ server)`.

use std::collections::HashMap;

use crate::context::{Context, ENV_PROTOCOL_VERSIONS};

/// Negotiate the protocol version against the client's advertised list.
///
/// Malformed entries in the list are reported through the server tracer and
/// skipped. Returns the chosen version and its registered implementation, or
/// `None` when the peers share no version.
pub(crate) fn negotiate<'a, V>(
    ctx: &Context,
    proto_versions: &'a HashMap<u32, V>,
) -> Option<(u32, &'a V)> {
    let tracer = ctx.server_tracer();

    let raw = ctx.getenv(ENV_PROTOCOL_VERSIONS).unwrap_or_default();
    if raw.is_empty() {
        // The client is not performing the negotiation protocol at all;
        // treat the missing list as a single empty version number.
        tracer.invalid_client_handshake_version("");
        return None;
    }

    let mut client_versions = Vec::new();
    for entry in raw.split(',') {
        match entry.parse::<u32>() {
            Ok(version) => client_versions.push(version),
            Err(_) => tracer.invalid_client_handshake_version(entry),
        }
    }

    // Newest first, so the first hit is the greatest common version.
    client_versions.sort_unstable_by(|a, b| b.cmp(a));

    for version in &client_versions {
        if let Some(server) = proto_versions.get(version) {
            return Some((*version, server));
        }
    }

    tracer.version_negotiation_failed(&client_versions);
    None
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};

    use rpcplugin_trace::ServerTracer;

    use super::*;

    #[derive(Default)]
    struct RecordingTracer {
        invalid: Mutex<Vec<String>>,
        failed: AtomicU32,
    }

    impl ServerTracer for RecordingTracer {
        fn invalid_client_handshake_version(&self, invalid: &str) {
            self.invalid.lock().unwrap().push(invalid.to_string());
        }

        fn version_negotiation_failed(&self, _client_versions: &[u32]) {
            self.failed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn versions(keys: &[u32]) -> HashMap<u32, ()> {
        keys.iter().map(|&k| (k, ())).collect()
    }

    fn ctx_with_versions(list: &str) -> Context {
        Context::new().with_env([(ENV_PROTOCOL_VERSIONS, list)])
    }

    #[test]
    fn test_picks_greatest_common_version() {
        let server = versions(&[2, 3]);
        let ctx = ctx_with_versions("1,2");
        let (version, _) = negotiate(&ctx, &server).unwrap();
        assert_eq!(version, 2);
    }

    #[test]
    fn test_order_of_client_list_is_irrelevant() {
        let server = versions(&[1, 2, 3]);
        for list in ["3,1,2", "1,2,3", "2,3,1"] {
            let ctx = ctx_with_versions(list);
            let (version, _) = negotiate(&ctx, &server).unwrap();
            assert_eq!(version, 3, "list {list:?}");
        }
    }

    #[test]
    fn test_no_common_version_fails_and_traces() {
        let tracer = Arc::new(RecordingTracer::default());
        let ctx = ctx_with_versions("1").with_server_tracer(tracer.clone());
        let server = versions(&[2]);
        assert!(negotiate(&ctx, &server).is_none());
        assert_eq!(tracer.failed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_malformed_entries_are_skipped_and_traced() {
        let tracer = Arc::new(RecordingTracer::default());
        let ctx = ctx_with_versions("nope,2,1.5").with_server_tracer(tracer.clone());
        let server = versions(&[2]);
        let (version, _) = negotiate(&ctx, &server).unwrap();
        assert_eq!(version, 2);
        assert_eq!(
            *tracer.invalid.lock().unwrap(),
            vec!["nope".to_string(), "1.5".to_string()]
        );
    }

    #[test]
    fn test_missing_version_list_fails() {
        let tracer = Arc::new(RecordingTracer::default());
        let ctx = Context::new()
            .with_env::<_, String, String>([])
            .with_server_tracer(tracer.clone());
        let server = versions(&[1]);
        assert!(negotiate(&ctx, &server).is_none());
        assert_eq!(*tracer.invalid.lock().unwrap(), vec![String::new()]);
    }
}
