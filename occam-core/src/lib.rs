#![deny(
    // The following are allowed by default lints according to
    // https://doc.rust-lang.org/rustc/lints/listing/allowed-by-default.html
    anonymous_parameters,
    bare_trait_objects,
    missing_copy_implementations,
    missing_debug_implementations,
    // missing_docs, // TODO: add documents
    trivial_numeric_casts,
    unstable_features,
    unused_extern_crates,
    unused_import_braces,
    unused_qualifications,
    unused_results,
    // variant_size_differences, // error variants intentionally differ

    warnings, // treat all wanings as errors

    clippy::all,
    // clippy::restriction,
    clippy::pedantic,
    // clippy::nursery, // It's still under development
    clippy::cargo,
)]
#![allow(
    // Some explicitly allowed Clippy lints, must have clear reason to allow
    clippy::blanket_clippy_restriction_lints, // allow clippy::restriction
    clippy::implicit_return, // actually omitting the return keyword is idiomatic Rust code
    clippy::module_name_repetitions, // repeation of module name in a struct name is not big deal
    clippy::multiple_crate_versions, // multi-version dependency crates is not able to fix
    clippy::missing_errors_doc, // TODO: add error docs
    clippy::missing_panics_doc, // TODO: add panic docs
    clippy::panic_in_result_fn,
    clippy::shadow_same, // Not too much bad
    clippy::shadow_reuse, // Not too much bad
    clippy::exhaustive_enums,
    clippy::exhaustive_structs,
    clippy::indexing_slicing,
    clippy::separated_literal_suffix, // conflicts with clippy::unseparated_literal_suffix
)]
//! Communicating-tasks runtime: a work-stealing scheduler executing
//! lightweight tasks that talk over rendezvous and buffered channels,
//! select over many channel ends with [`Choice`], time out with
//! [`Timer`] and address each other through per-task mailboxes.
//!
//! ```
//! use occam_core::channel::Channel;
//! use occam_core::task::Future;
//!
//! let channel = Channel::rendezvous();
//! let writer = channel.writer();
//! let producer = Future::new(move |_| writer.write(21));
//! producer.start().unwrap();
//! assert_eq!(channel.reader().read().unwrap(), 21);
//! producer.result().unwrap().unwrap();
//! ```

pub mod log;

pub mod config;

pub mod error;

pub mod barrier;

pub mod channel;

pub mod choice;

pub mod task;

pub mod scheduler;

pub mod threadpool;

pub mod timer;

pub use barrier::Barrier;
pub use channel::{BufferKind, BufferState, Channel, ChannelReader, ChannelWriter};
pub use choice::{Alternative, AlternativeKind, Choice};
pub use error::{Error, Result};
pub use task::{Address, Async, Future, Task};
pub use timer::Timer;
