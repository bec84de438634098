//! Instrumentation registry and verification.
//!
//! Suspendable computations cooperate with the continuation stack by
//! hand: each suspendable function calls `enter`/`save`/`leave` and
//! registers itself here. The registry answers two questions for the
//! runtime: is a computation type instrumented (checked once, at fiber
//! construction), and is a given frame label instrumented or waived
//! (checked at every park when verification is switched on).
//!
//! Waived sites are callees that are legitimately not instrumented and
//! are re-executed from the top on every resume, such as the built-in
//! `sleep`, which keeps its cross-slice state on the fiber instead of in
//! a frame.
//!
//! Verification is off by default; set `FIBRIL_VERIFY_INSTRUMENTATION=1`
//! to have every park walk the live frame labels and fail fast on an
//! unregistered one. The variable is read once per process.

use std::any::TypeId;
use std::collections::HashSet;
use std::sync::{OnceLock, RwLock};

#[derive(Default)]
struct Registry {
    types: HashSet<TypeId>,
    sites: HashSet<&'static str>,
    waivers: HashSet<&'static str>,
}

fn registry() -> &'static RwLock<Registry> {
    static REGISTRY: OnceLock<RwLock<Registry>> = OnceLock::new();
    REGISTRY.get_or_init(|| RwLock::new(Registry::default()))
}

/// Marks a computation type as instrumented.
///
/// Call once (idempotent) before constructing fibers from values of `T`.
pub fn register_type<T: 'static>() {
    let mut reg = registry().write().expect("instrument registry poisoned");
    reg.types.insert(TypeId::of::<T>());
}

/// Returns true if `T` was registered as instrumented.
#[must_use]
pub fn is_instrumented_type<T: 'static>() -> bool {
    let reg = registry().read().expect("instrument registry poisoned");
    reg.types.contains(&TypeId::of::<T>())
}

/// Marks a frame label as an instrumented call site.
pub fn register_site(site: &'static str) {
    let mut reg = registry().write().expect("instrument registry poisoned");
    reg.sites.insert(site);
}

/// Returns true if the frame label is a registered call site.
#[must_use]
pub fn is_instrumented_site(site: &str) -> bool {
    let reg = registry().read().expect("instrument registry poisoned");
    reg.sites.contains(site)
}

/// Puts a call site on the waiver list.
pub fn add_waiver(site: &'static str) {
    let mut reg = registry().write().expect("instrument registry poisoned");
    reg.waivers.insert(site);
}

/// Returns true if the call site is waived from verification.
#[must_use]
pub fn is_waiver(site: &str) -> bool {
    let reg = registry().read().expect("instrument registry poisoned");
    reg.waivers.contains(site)
}

/// Whether park-time verification is enabled for this process.
#[must_use]
pub fn verify_enabled() -> bool {
    static ENABLED: OnceLock<bool> = OnceLock::new();
    *ENABLED.get_or_init(|| {
        std::env::var("FIBRIL_VERIFY_INSTRUMENTATION")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false)
    })
}

/// Walks the live frame labels of a parking fiber.
///
/// # Panics
///
/// Panics on the first label that is neither a registered call site nor
/// waived: an uninstrumented frame sits on a suspendable path, which
/// would corrupt replay.
pub(crate) fn verify_frames<'a>(labels: impl Iterator<Item = &'a str>) {
    let reg = registry().read().expect("instrument registry poisoned");
    for label in labels {
        assert!(
            reg.sites.contains(label) || reg.waivers.contains(label),
            "frame `{label}` on a suspendable path is not instrumented"
        );
    }
}
