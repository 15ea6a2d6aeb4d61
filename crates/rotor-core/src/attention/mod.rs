//! Attention for incremental decoding.
//!
//! This module provides:
//! - [`SelfAttention`] - Per-layer projections, rotary embedding and KV cache
//! - [`repeat_kv`] - Broadcast of KV heads across query heads (GQA)
//! - [`grouped_attention`] - Scaled dot-product attention over cached history

mod gqa;
mod self_attn;

pub use gqa::{grouped_attention, repeat_kv};
pub use self_attn::SelfAttention;
