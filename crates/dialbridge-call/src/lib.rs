//! Call side of the bridge: tone decoding, prompts and the per-call session
//! that joins a conference room on the caller's behalf.

pub mod directory;
pub mod dtmf;
pub mod gateway;
pub mod leg;
pub mod prompts;
pub mod registry;
pub mod session;

pub use directory::{RoomDirectory, StaticRoomDirectory};
pub use dtmf::{DtmfError, DtmfEvent, DtmfTone, parse_info};
pub use gateway::{Gateway, GatewayStats};
pub use leg::{CallEvent, CallLeg, CallState, InfoReply, InfoRequest, MediaConstraints};
pub use prompts::{Prompt, PromptLibrary, PromptPlayer};
pub use registry::SessionRegistry;
pub use session::{CallBridgeSession, SessionContext, SessionHandle, SessionSnapshot};
