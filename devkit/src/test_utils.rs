/*!
Test harness for kernel and agent tests

Bundles a `MockBus` and a `ScriptedShell` pre-seeded like a freshly installed appliance,
with `env_logger` capture turned on so `log` output from the doubles shows up under
`cargo test -- --nocapture`.
*/

use crate::mqtt_stub::MockBus;
use crate::shell_stub::ScriptedShell;
use std::collections::HashMap;
use std::sync::Arc;
use unas_core::{RemoteShell, Topics};

pub struct TestHarness {
    pub bus: MockBus,
    pub shell: ScriptedShell,
    pub topics: Topics,
}

impl TestHarness {
    pub fn new() -> Self {
        env_logger::builder().is_test(true).try_init().ok();
        Self {
            bus: MockBus::new(),
            shell: ScriptedShell::new(),
            topics: Topics::default(),
        }
    }

    /// Appliance with the given files in place and both services running.
    pub fn installed(markers: &[&str]) -> Self {
        let harness = Self::new();
        for path in markers {
            harness.shell.add_file(path);
        }
        harness.shell.set_service("unas_monitor", true);
        harness.shell.set_service("fan_control", true);
        harness
    }

    pub fn shared_shell(&self) -> Arc<dyn RemoteShell> {
        Arc::new(self.shell.clone())
    }

    /// Count of publishes per topic.
    pub fn topic_counts(&self) -> HashMap<String, usize> {
        let mut counts = HashMap::new();
        for msg in self.bus.published() {
            *counts.entry(msg.topic).or_insert(0) += 1;
        }
        counts
    }

    pub fn assert_published(&self, topic: &str, payload: &str) {
        let found = self.bus.find_messages_by_topic(topic);
        assert!(
            found.iter().any(|m| m.payload == payload),
            "expected {payload:?} on {topic}, got {:?}",
            found.iter().map(|m| &m.payload).collect::<Vec<_>>()
        );
        log::info!("✅ found {payload} on {topic}");
    }

    pub fn assert_not_published(&self, topic: &str) {
        let found = self.bus.find_messages_by_topic(topic);
        assert!(found.is_empty(), "unexpected publish on {topic}: {found:?}");
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}
