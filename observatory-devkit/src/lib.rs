/*!
# Observatory DevKit - Test doubles for the supervisor kernel

Runs the real kernel against in-process fakes:
- Scriptable device daemons behind a `DeviceConnector`
- Recording alert sink, process killer and exposure log
- `TestHarness` wiring a full supervisor with fast intervals and a pinned clock
*/

pub mod mock_device;
pub mod recorders;
pub mod test_utils;

pub use mock_device::{MockConnector, MockDevice};
pub use recorders::{MemoryExposureLog, RecordingAlertSink, RecordingKiller};
pub use test_utils::{wait_for, TestHarness};
