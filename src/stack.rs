//! Heap-resident continuation stack: capture and replay.
//!
//! While a fiber runs, every instrumented function keeps one [`Frame`]
//! here, pushed by [`ContinuationStack::enter`] and popped by
//! [`ContinuationStack::leave`]. When the fiber suspends, the signal
//! unwinds through the instrumented frames and each one records its
//! resume index and live locals with [`ContinuationStack::save`] on the
//! way out, so the vector of frames becomes the fiber's captured call
//! stack. On the next slice the same entry point is invoked again;
//! `enter` now runs in replay mode and hands each function its saved
//! resume index so the generated prologue can jump past already-executed
//! code, restoring locals through the typed slot accessors. Replay mode
//! clears once the frame that contained the suspension point is reached.
//!
//! Each frame owns two slot arrays sized at entry: plain `u64` words for
//! primitives (floats travel via their bit patterns) and boxed values
//! for references. The frame label is the instrumented call site's name;
//! it anchors instrumentation verification and guards replay against
//! divergent call paths.

use smallvec::SmallVec;
use std::any::Any;

use crate::tracing_compat::trace;

/// One captured activation record.
#[derive(Debug)]
pub struct Frame {
    label: &'static str,
    resume: u32,
    words: SmallVec<[u64; 8]>,
    refs: Vec<Option<Box<dyn Any + Send>>>,
}

impl Frame {
    fn new(label: &'static str, words: usize, refs: usize) -> Self {
        let mut word_slots = SmallVec::with_capacity(words);
        word_slots.resize(words, 0);
        let mut ref_slots = Vec::with_capacity(refs);
        ref_slots.resize_with(refs, || None);
        Self {
            label,
            resume: 0,
            words: word_slots,
            refs: ref_slots,
        }
    }

    /// The instrumented call site this frame belongs to.
    #[must_use]
    pub fn label(&self) -> &'static str {
        self.label
    }

    /// The recorded resume index.
    #[must_use]
    pub fn resume(&self) -> u32 {
        self.resume
    }

    /// Writes a primitive word slot.
    pub fn put_word(&mut self, slot: usize, value: u64) {
        self.words[slot] = value;
    }

    /// Reads a primitive word slot.
    #[must_use]
    pub fn get_word(&self, slot: usize) -> u64 {
        self.words[slot]
    }

    /// Writes a signed integer slot.
    pub fn put_i64(&mut self, slot: usize, value: i64) {
        self.words[slot] = value as u64;
    }

    /// Reads a signed integer slot.
    #[must_use]
    pub fn get_i64(&self, slot: usize) -> i64 {
        self.words[slot] as i64
    }

    /// Writes a float slot (stored as its bit pattern).
    pub fn put_f64(&mut self, slot: usize, value: f64) {
        self.words[slot] = value.to_bits();
    }

    /// Reads a float slot.
    #[must_use]
    pub fn get_f64(&self, slot: usize) -> f64 {
        f64::from_bits(self.words[slot])
    }

    /// Moves a reference value into a slot.
    pub fn put_ref<T: Any + Send>(&mut self, slot: usize, value: T) {
        self.refs[slot] = Some(Box::new(value));
    }

    /// Moves a reference value out of a slot, downcast to its type.
    ///
    /// # Panics
    ///
    /// Panics if the slot holds a value of a different type; replay must
    /// restore exactly what capture saved.
    #[must_use]
    pub fn take_ref<T: Any + Send>(&mut self, slot: usize) -> Option<T> {
        self.refs[slot].take().map(|boxed| {
            *boxed
                .downcast::<T>()
                .unwrap_or_else(|_| panic!("reference slot {slot} holds a different type"))
        })
    }

    /// Number of primitive word slots.
    #[must_use]
    pub fn word_slots(&self) -> usize {
        self.words.len()
    }

    /// Number of reference slots.
    #[must_use]
    pub fn ref_slots(&self) -> usize {
        self.refs.len()
    }

    pub(crate) fn occupied_refs(&self) -> usize {
        self.refs.iter().filter(|r| r.is_some()).count()
    }

    pub(crate) fn word_image(&self) -> Vec<u64> {
        self.words.to_vec()
    }
}

/// The captured logical call stack of a fiber.
///
/// Mutated only from within the owning fiber's slice; the fiber holds it
/// behind a lock taken per operation, never across a suspension.
#[derive(Debug, Default)]
pub struct ContinuationStack {
    frames: Vec<Frame>,
    /// Depth of the live call path: frames `0..current` are entered.
    current: usize,
    /// True while captured frames are still being re-entered.
    replay: bool,
}

impl ContinuationStack {
    /// Creates an empty stack with room for `capacity` frames.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            frames: Vec::with_capacity(capacity),
            current: 0,
            replay: false,
        }
    }

    /// Function-entry hook for instrumented code.
    ///
    /// Fresh call: pushes a frame with the given slot capacities and
    /// returns `0`. Replay: consumes the next captured frame and returns
    /// its resume index; the caller jumps to the matching point. Replay
    /// mode clears when the innermost captured frame is consumed.
    ///
    /// # Panics
    ///
    /// Panics if replay meets a frame recorded for a different call
    /// site; that means the re-entered call path diverged from the
    /// captured one, which is a structural bug.
    pub fn enter(&mut self, label: &'static str, words: usize, refs: usize) -> u32 {
        if self.replay && self.current < self.frames.len() {
            let frame = &self.frames[self.current];
            assert!(
                frame.label == label,
                "replay diverged: expected frame `{}`, entered `{label}`",
                frame.label
            );
            self.current += 1;
            if self.current == self.frames.len() {
                self.replay = false;
            }
            trace!(label, resume = frame.resume, "frame replayed");
            return frame.resume;
        }
        self.frames.push(Frame::new(label, words, refs));
        self.current += 1;
        0
    }

    /// Capture hook: records the resume index for the innermost
    /// not-yet-saved frame and hands it out for local writes.
    ///
    /// Called by each instrumented frame, innermost first, while the
    /// suspension signal unwinds. The frame then propagates the signal.
    ///
    /// # Panics
    ///
    /// Panics when there is no entered frame to save into.
    pub fn save(&mut self, resume: u32) -> &mut Frame {
        assert!(self.current > 0, "save() without a matching enter()");
        self.current -= 1;
        let frame = &mut self.frames[self.current];
        frame.resume = resume;
        frame
    }

    /// Restore accessor: the frame most recently consumed by a
    /// replaying [`enter`](Self::enter).
    ///
    /// # Panics
    ///
    /// Panics when no frame is live.
    pub fn restored(&mut self) -> &mut Frame {
        assert!(self.current > 0, "restored() with no live frame");
        &mut self.frames[self.current - 1]
    }

    /// Function-exit hook for instrumented code: pops the top frame.
    ///
    /// # Panics
    ///
    /// Panics when the live path and the frame vector disagree, i.e. a
    /// `leave` without a matching `enter`.
    pub fn leave(&mut self) {
        assert!(
            self.current == self.frames.len() && self.current > 0,
            "leave() without a matching enter()"
        );
        self.frames.pop();
        self.current -= 1;
    }

    /// Arms replay for the next slice, called once the suspension signal
    /// has fully unwound.
    ///
    /// # Panics
    ///
    /// Panics if some entered frame never saved — the signal escaped an
    /// instrumented frame without being captured, a structural bug.
    pub(crate) fn finish_capture(&mut self) {
        assert!(
            self.current == 0,
            "suspension signal escaped {} frame(s) without capture",
            self.current
        );
        self.replay = !self.frames.is_empty();
    }

    /// True while captured frames remain to be re-entered.
    #[must_use]
    pub fn is_replaying(&self) -> bool {
        self.replay
    }

    /// Number of captured/live frames.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// True when no frames are held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Drops all captured state (fiber termination).
    pub(crate) fn clear(&mut self) {
        self.frames.clear();
        self.current = 0;
        self.replay = false;
    }

    /// Iterates the captured frames, outermost first.
    pub fn frames(&self) -> impl Iterator<Item = &Frame> {
        self.frames.iter()
    }
}
