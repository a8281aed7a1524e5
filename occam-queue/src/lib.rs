#![deny(
    // The following are allowed by default lints according to
    // https://doc.rust-lang.org/rustc/lints/listing/allowed-by-default.html
    anonymous_parameters,
    bare_trait_objects,
    missing_copy_implementations,
    missing_debug_implementations,
    missing_docs,
    trivial_numeric_casts,
    unstable_features,
    unused_extern_crates,
    unused_import_braces,
    unused_qualifications,
    unused_results,
    variant_size_differences,

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
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::exhaustive_enums,
    clippy::exhaustive_structs,
    clippy::indexing_slicing,
    clippy::separated_literal_suffix, // conflicts with clippy::unseparated_literal_suffix
)]

//! Work-stealing deques for the occam scheduler.
//!
//! Each scheduler worker owns one [`Deque`]. The owning thread pushes,
//! pops and removes from the bottom end; any other thread may [`steal`]
//! from the top end. The owner side is plain loads and stores, the
//! contended end is a single compare-and-swap on a packed `(tag, top)`
//! word, so a steal never blocks the owner and vice versa.
//!
//! [`steal`]: Deque::steal
//!
//! # Examples
//!
//! ```
//! use occam_queue::Deque;
//!
//! let deque = Deque::new(4);
//! deque.push(1);
//! deque.push(2);
//! deque.push(3);
//! assert_eq!(deque.steal(), Some(1));
//! assert_eq!(deque.pop(), Some(3));
//! assert_eq!(deque.pop(), Some(2));
//! assert_eq!(deque.pop(), None);
//! ```

pub use deque::Deque;
pub use raw::RawDeque;

/// Growable owner deque impl.
pub mod deque;

/// Fixed-capacity lock-free deque impl.
pub mod raw;
