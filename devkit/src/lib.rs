/*!
# UNAS DevKit - test doubles and fixtures

Shared by the agent and kernel test suites:
- `MockBus`: in-memory bus recording every publish, with a retained view and a connectivity switch
- `ScriptedShell`: remote shell fake with a virtual file set and systemd service table
- `fixtures`: captured `/proc`, `df` and `smartctl` outputs from a UNAS Pro
- `TestHarness`: bus + shell pair with log capture enabled
*/

pub mod fixtures;
pub mod mqtt_stub;
pub mod shell_stub;
pub mod test_utils;

pub use mqtt_stub::{MockBus, MockMessage};
pub use shell_stub::ScriptedShell;
pub use test_utils::TestHarness;
