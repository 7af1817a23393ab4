//! Text transform pipeline: replacement rules, keyword filtering, long
//! message splitting and the source-link suffix.

pub mod filter;
pub mod link;
pub mod rules;
pub mod split;

pub use {
    filter::should_forward,
    link::{source_link, source_link_url},
    rules::{RulePipeline, TextOutcome, process_text},
    split::split_long_message,
};
