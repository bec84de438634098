//! Serialized image of a non-running fiber.
//!
//! A fiber that is not `Running` can be frozen into a [`FrozenFiber`]:
//! the primitive content of its continuation stack (word slots and
//! resume indices, frame by frame) plus identity metadata. The image is
//! serde-serializable and otherwise opaque.
//!
//! Two structural rules apply:
//!
//! - Freezing a `Running` fiber fails with
//!   [`ErrorKind::RunningFiber`] — its frames are in flight.
//! - Occupied reference slots fail with [`ErrorKind::Unserializable`]:
//!   boxed trait objects carry no wire form.

use serde::{Deserialize, Serialize};

use crate::error::{Error, ErrorKind, Result};
use crate::fiber::{Fiber, FiberState};

/// One frame of a frozen continuation stack.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrozenFrame {
    /// The instrumented call site the frame belongs to.
    pub label: String,
    /// The recorded resume index.
    pub resume: u32,
    /// The primitive word slots.
    pub words: Vec<u64>,
}

/// The opaque serialized image of a fiber.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrozenFiber {
    /// The fiber's name, if any.
    pub name: Option<String>,
    /// Lifecycle state at freeze time (never `Running`).
    pub state: String,
    /// Captured frames, outermost first.
    pub frames: Vec<FrozenFrame>,
}

impl Fiber {
    /// Freezes the fiber's captured state.
    ///
    /// Fails structurally on a `Running` fiber and on continuations
    /// holding reference slots.
    pub fn freeze(&self) -> Result<FrozenFiber> {
        let state = self.state();
        if state == FiberState::Running {
            return Err(
                Error::new(ErrorKind::RunningFiber).with_context("cannot freeze a running fiber")
            );
        }
        self.with_stack_mut(|stack| {
            let mut frames = Vec::with_capacity(stack.depth());
            for frame in stack.frames() {
                if frame.occupied_refs() > 0 {
                    return Err(Error::new(ErrorKind::Unserializable).with_context(format!(
                        "frame `{}` holds {} reference slot(s)",
                        frame.label(),
                        frame.occupied_refs()
                    )));
                }
                frames.push(FrozenFrame {
                    label: frame.label().to_string(),
                    resume: frame.resume(),
                    words: frame.word_image(),
                });
            }
            Ok(FrozenFiber {
                name: self.name().map(str::to_string),
                state: format!("{state:?}"),
                frames,
            })
        })
    }
}
