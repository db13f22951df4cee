//! Removal of runtime module bodies from a finished bundle
//!
//! Structured bundles drop the module by name. Text bundles fall back to
//! locating the `__bundle_register("<name>", ...)` block by its line-initial
//! marker; the block runs until the next line-initial registration or the
//! closing `return __bundle_require(` line. Everything outside removed blocks
//! is kept byte for byte.

use std::ops::Range;

use indexmap::IndexSet;
use log::{debug, trace};
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

use crate::bundle::{BundleOutput, ROOT_MODULE_NAME};

/// Line-initial markers that can end a registration block
static BLOCK_BOUNDARY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)^(?:__bundle_register\(|return __bundle_require\()")
        .expect("boundary pattern is valid")
});

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PostProcessError {
    #[error("registration block for '{module}' does not end with `end)`")]
    UnterminatedBlock { module: String },

    #[error("invalid registration pattern for '{module}': {reason}")]
    Pattern { module: String, reason: String },
}

/// Which global modules were removed, and which had nothing to remove
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StripReport {
    pub stripped: Vec<String>,
    pub missing: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StrippedBundle {
    pub text: String,
    pub report: StripReport,
}

/// Remove every global module from an engine result and render it
pub fn strip_global_modules(
    output: BundleOutput,
    globals: &IndexSet<String>,
) -> Result<StrippedBundle, PostProcessError> {
    match output {
        BundleOutput::Structured(mut document) => {
            let mut report = StripReport::default();
            for name in globals {
                if name != ROOT_MODULE_NAME && document.remove(name) {
                    report.stripped.push(name.clone());
                } else {
                    report.missing.push(name.clone());
                }
            }
            debug!(
                "Stripped {} runtime module(s) from structured bundle",
                report.stripped.len()
            );
            Ok(StrippedBundle {
                text: document.render(),
                report,
            })
        }
        BundleOutput::Text { text } => strip_registration_blocks(&text, globals),
    }
}

/// Remove the registration blocks of `globals` from raw bundle text
pub fn strip_registration_blocks(
    text: &str,
    globals: &IndexSet<String>,
) -> Result<StrippedBundle, PostProcessError> {
    let boundaries: Vec<usize> = BLOCK_BOUNDARY.find_iter(text).map(|m| m.start()).collect();
    let mut report = StripReport::default();
    let mut spans: Vec<Range<usize>> = Vec::new();

    for name in globals {
        let Some(start) = find_block_start(text, name)? else {
            trace!("No registration block for '{name}'");
            report.missing.push(name.clone());
            continue;
        };
        let end = boundaries
            .iter()
            .copied()
            .find(|&boundary| boundary > start)
            .unwrap_or(text.len());

        if !text[start..end].trim_end().ends_with("end)") {
            return Err(PostProcessError::UnterminatedBlock {
                module: name.clone(),
            });
        }
        spans.push(start..end);
        report.stripped.push(name.clone());
    }

    spans.sort_unstable_by_key(|span| span.start);
    let mut stripped = String::with_capacity(text.len());
    let mut cursor = 0;
    for span in spans {
        stripped.push_str(&text[cursor..span.start]);
        cursor = span.end;
    }
    stripped.push_str(&text[cursor..]);

    debug!(
        "Stripped {} runtime module(s) from bundle text ({} bytes removed)",
        report.stripped.len(),
        text.len() - stripped.len()
    );
    Ok(StrippedBundle {
        text: stripped,
        report,
    })
}

fn find_block_start(text: &str, module: &str) -> Result<Option<usize>, PostProcessError> {
    let name = regex::escape(module);
    let pattern = format!(r#"(?m)^__bundle_register\(\s*(?:"{name}"|'{name}')\s*,"#);
    let regex = Regex::new(&pattern).map_err(|e| PostProcessError::Pattern {
        module: module.to_owned(),
        reason: e.to_string(),
    })?;
    Ok(regex.find(text).map(|m| m.start()))
}
