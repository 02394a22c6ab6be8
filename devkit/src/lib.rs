/*!
# Pinger DevKit - fakes and harness for the collector kernel

Lets the supervisor run complete cycles without a network:
- scripted prober with a settable clock and an in-flight probe gauge
- in-memory device registry, settings store and sinks (optionally failing)
- recording notification transport
- `TestHarness` wiring all of the above around a real `Supervisor`
*/

pub mod fakes;
pub mod fixtures;
pub mod test_utils;

pub use fakes::{
    FailingPingLog, MemoryMetricLog, MemoryPingLog, RecordingTransport, ScriptedProber, SentMessage, StaticDevices,
    StaticSettings, Step,
};
pub use test_utils::TestHarness;
