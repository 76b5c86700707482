use std::time::Duration;

/// Default Kademlia replication factor (k): how many nodes a lookup asks for.
pub const DEFAULT_LOOKUP_LIMIT: usize = 20;

/// Dialer tuning knobs.
#[derive(Clone, Debug)]
pub struct DialerConfig {
    /// Budget for one whole call: dial, handshake and response wait.
    /// Combined with the transport's own timeout; the smaller one wins.
    /// `None` leaves only the transport timeout in force.
    pub call_timeout: Option<Duration>,
    /// `limit` sent with every FIND_NODE request.
    pub lookup_limit: usize,
    /// Pooled sessions beyond this are evicted least-recently-used first.
    pub max_pooled_connections: usize,
    /// Pooled sessions unused for this long are redialed instead of reused.
    pub idle_timeout: Duration,
    /// How long `close` waits for borrowed connections before closing
    /// them underneath their borrowers.
    pub close_grace: Duration,
}

impl Default for DialerConfig {
    fn default() -> Self {
        Self {
            call_timeout: Some(Duration::from_secs(30)),
            lookup_limit: DEFAULT_LOOKUP_LIMIT,
            max_pooled_connections: 1_000,
            idle_timeout: Duration::from_secs(60),
            close_grace: Duration::from_secs(5),
        }
    }
}

impl DialerConfig {
    /// Effective per-call budget: the smallest of the caller's budget, the
    /// configured call timeout and the transport's timeout.
    pub(crate) fn call_budget(
        &self,
        caller: Option<Duration>,
        transport_timeout: Option<Duration>,
    ) -> Option<Duration> {
        [caller, self.call_timeout, transport_timeout].into_iter().flatten().min()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn smaller_timeout_wins() {
        let config = DialerConfig::default();
        assert_eq!(
            config.call_budget(None, Some(Duration::from_millis(20))),
            Some(Duration::from_millis(20))
        );
        assert_eq!(config.call_budget(None, Some(Duration::from_secs(300))), config.call_timeout);
        assert_eq!(config.call_budget(None, None), config.call_timeout);
    }

    #[test]
    fn caller_budget_only_tightens() {
        let config = DialerConfig::default();
        let tight = Some(Duration::from_millis(5));
        assert_eq!(config.call_budget(tight, Some(Duration::from_secs(1))), tight);
        assert_eq!(
            config.call_budget(Some(Duration::from_secs(600)), None),
            config.call_timeout,
            "a generous caller budget cannot extend the configured limit"
        );
        assert_eq!(
            config.call_budget(Some(Duration::from_secs(600)), Some(Duration::from_millis(20))),
            Some(Duration::from_millis(20))
        );
    }

    #[test]
    fn unbounded_call_falls_back_to_transport() {
        let config = DialerConfig {
            call_timeout: None,
            ..DialerConfig::default()
        };
        assert_eq!(config.call_budget(None, None), None);
        assert_eq!(
            config.call_budget(None, Some(Duration::from_secs(1))),
            Some(Duration::from_secs(1))
        );
        assert_eq!(
            config.call_budget(Some(Duration::from_millis(30)), None),
            Some(Duration::from_millis(30))
        );
    }
}
