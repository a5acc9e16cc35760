//! Tracing garbage collector for the Malang runtime.
//!
//! Stop-the-world tricolor mark-and-sweep over an intrusive all-objects
//! list. The collector is decoupled from the VM: consumers provide a
//! [`TraceFn`] to enumerate object edges and a [`RootProvider`] to supply
//! live roots at collection time.

mod gc;

pub use gc::{
    CollectionReport, Gc, GcConfig, GcStats, RootProvider, TraceFn,
};
