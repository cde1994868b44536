//! Request envelopes for the two upstream protocol shapes.

use serde_json::{json, Value};

use crate::registry::ProtocolShape;

/// Build the cheapest possible synthetic request body for a shape: the
/// canonical prompt, a small fixed output-token budget, and an optional
/// system instruction.
pub fn request_body(
    shape: ProtocolShape,
    model: &str,
    prompt: &str,
    system: Option<&str>,
    max_tokens: u32,
) -> Value {
    match shape {
        ProtocolShape::Chat => {
            let mut messages = Vec::new();
            if let Some(system) = system {
                messages.push(json!({"role": "system", "content": system}));
            }
            messages.push(json!({"role": "user", "content": prompt}));
            json!({
                "model": model,
                "max_tokens": max_tokens,
                "messages": messages,
            })
        }
        ProtocolShape::Structured => {
            let mut body = json!({
                "model": model,
                "max_output_tokens": max_tokens,
                "input": prompt,
            });
            if let Some(system) = system {
                body["instructions"] = json!(system);
            }
            body
        }
    }
}
