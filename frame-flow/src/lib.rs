//! Inter-thread plumbing for the acquisition pipeline: the latest-wins
//! mailbox in front of the detector, the fan-out hub, the sliding-window FPS
//! counter and the playback/detector hand-shake.

mod mailbox;
pub use mailbox::Mailbox;

mod hub;
pub use hub::Hub;

mod fps;
pub use fps::{FpsCounter, FpsReport};

mod playback_sync;
pub use playback_sync::PlaybackSync;
