//! Turn orchestration for deepsearch.
//!
//! A turn follows a **persist → stream → loop → persist → close** cycle:
//!
//! 1. **Persist** the submitted history (creating the conversation if needed)
//! 2. **Open** the turn's event stream
//! 3. **Loop**: generate, run any requested tools concurrently, feed the
//!    outcomes back, until the model answers or the step cap is hit
//! 4. **Persist** the merged history
//! 5. **Close** the stream
//!
//! [`AgentLoop`] is step 3 alone and never touches storage;
//! [`TurnService`] drives the whole cycle.

pub mod locks;
pub mod loop_runner;
pub mod prompt;
pub mod publisher;
pub mod stream_event;
pub mod trace;
pub mod turn;

#[cfg(any(test, feature = "test-helpers"))]
pub mod test_helpers;

pub use locks::ConversationLocks;
pub use loop_runner::{AgentLoop, DEFAULT_MAX_STEPS, FinishReason, LoopState, TurnFinish, TurnOutcome};
pub use publisher::{GENERIC_ERROR_MESSAGE, StreamPublisher};
pub use stream_event::{ControlEvent, TurnEvent};
pub use trace::{TraceSpan, TurnTrace};
pub use turn::{TurnError, TurnHandle, TurnRequest, TurnService, TurnSummary};
