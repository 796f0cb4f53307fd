//! # Inferir
//!
//! Pure Rust, CPU-only autoregressive transformer inference core.
//!
//! Inferir (Spanish: "to infer") turns token ids plus block-quantized model
//! weights into a stream of generated tokens: no GPU, no network, no
//! external math libraries. Container parsing and tokenization live
//! outside; this crate is the numeric engine in between.
//!
//! ## Components
//!
//! - [`kernels`]: elementwise, activation, normalization, softmax, and
//!   matrix-multiply primitives with a SIMD tier probed once and cached
//! - [`quantize`]: block formats `Q4_0`/`Q5_0`/`Q5_1`/`Q8_0`/`Q4_K`/`Q6_K`
//!   plus fused quantized matvec
//! - [`cache`] + [`attention`]: pre-allocated KV storage and the causal
//!   attention pipeline, grouped-query aware
//! - [`model`]: a minimal transformer forward pass over a [`model::WeightSource`]
//! - [`generate`]: the decode/sampling state machine, one token at a time
//! - [`pool`]: rent/return scratch buffers with scope-guarded ownership
//!
//! ## Example
//!
//! ```rust
//! use inferir::Tensor;
//!
//! let a = Tensor::from_vec(vec![2, 3], vec![
//!     1.0, 2.0, 3.0,
//!     4.0, 5.0, 6.0,
//! ]).unwrap();
//!
//! assert_eq!(a.shape(), &[2, 3]);
//! assert_eq!(a.size(), 6);
//! ```
//!
//! ## Determinism
//!
//! Kernels accumulate in fixed orders, the sampler draws from a seeded RNG,
//! and quantization is a pure function of its input: identical seed, options
//! and weights reproduce a generation byte for byte on the same build.

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
// Clippy allows (MUST come after deny/warn to override them)
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::cast_precision_loss)] // usize -> f32 precision loss is acceptable
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::float_cmp)] // Float comparisons in tests
#![allow(clippy::many_single_char_names)] // Math-heavy kernels
#![allow(clippy::needless_range_loop)] // Index loops over multiple slices
#![allow(clippy::large_stack_arrays)] // Quantization super-blocks

pub mod attention;
pub mod cache;
pub mod error;
pub mod generate;
pub mod kernels;
pub mod model;
pub mod pool;
pub mod quantize;
pub mod tensor;

pub use error::{InferirError, Result};
pub use tensor::Tensor;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
