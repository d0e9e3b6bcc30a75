//! Property-based tests for the Message Bus

#[cfg(test)]
mod property_tests {
    use crate::agents::AgentDirectory;
    use crate::communication::{AgentInbox, MessageBus, MessageKind};
    use crate::config::BusConfig;
    use proptest::prelude::*;
    use std::sync::Arc;

    fn agent_set_strategy(min: usize, max: usize) -> impl Strategy<Value = Vec<String>> {
        prop::collection::hash_set("[a-z][a-z0-9_]{0,10}", min..max)
            .prop_map(|set| set.into_iter().collect())
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        /// Broadcast reaches every registered agent exactly once, except the
        /// excluded one
        #[test]
        fn prop_broadcast_delivers_once(
            agents in agent_set_strategy(1, 10),
            exclude_index in any::<prop::sample::Index>(),
        ) {
            let bus = MessageBus::new(Arc::new(AgentDirectory::new()), BusConfig::default());
            let mut inboxes: Vec<AgentInbox> =
                agents.iter().map(|a| bus.register_agent(a.clone())).collect();
            let excluded = exclude_index.get(&agents).clone();

            let recipients = bus.broadcast(MessageKind::Heartbeat, Some(&excluded));
            prop_assert_eq!(recipients, agents.len() - 1);

            for inbox in inboxes.iter_mut() {
                let expected = if inbox.agent_id() == excluded { 0 } else { 1 };
                prop_assert_eq!(inbox.drain().len(), expected);
            }
        }

        /// The log never grows past its bound and keeps the newest messages
        #[test]
        fn prop_log_bounded(max_log_size in 1usize..20, sends in 0usize..60) {
            let config = BusConfig { max_log_size, ..Default::default() };
            let bus = MessageBus::new(Arc::new(AgentDirectory::new()), config);
            let _inbox = bus.register_agent("a");

            for i in 0..sends {
                bus.send("a", "a", MessageKind::custom("seq", serde_json::json!(i)));
            }

            let history = bus.history(None);
            prop_assert_eq!(history.len(), sends.min(max_log_size));
            if sends > 0 {
                prop_assert_eq!(
                    &history[0].kind,
                    &MessageKind::custom("seq", serde_json::json!(sends - 1))
                );
            }
        }
    }
}
