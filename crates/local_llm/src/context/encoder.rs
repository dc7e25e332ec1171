//! Splices attachments into a prompt, decoding text and embeddings in prompt order.

use std::collections::HashMap;

use tracing::trace;

use super::{Context, ContextError, DecodeContext};
use crate::{Backend, PromptAttachment};

/// Decodes `prompt` into `context`, replacing each marker of `attachments` with its attachment.
///
/// Markers are consumed left to right: at each step the marker occurring earliest after the
/// previously consumed one is found, the text before it is decoded, then the attachment itself.
/// The text following the last marker is decoded last.
///
/// Fails if a marker is empty, does not occur in the remaining prompt, or starts at the same
/// position as another marker.
pub fn encode_prompt<B: Backend>(
    context: &mut Context<B>,
    mut decode_context: DecodeContext,
    prompt: &str,
    mut attachments: HashMap<String, PromptAttachment>,
) -> Result<DecodeContext, ContextError> {
    let mut position = 0;

    while !attachments.is_empty() {
        let (start, marker) = next_marker(prompt, position, &attachments)?;

        if start > position {
            decode_context = context.decode_text(&prompt[position..start], decode_context)?;
        }

        let Some(attachment) = attachments.remove(&marker) else {
            return Err(ContextError::MissingMarker(marker));
        };

        trace!("Encoding attachment `{marker}` at byte {start}");
        decode_context = match attachment {
            PromptAttachment::Text(text) => context.decode_text(&text, decode_context)?,
            PromptAttachment::Image(embedding) => {
                context.decode_image(&embedding, decode_context)?
            }
        };

        position = start + marker.len();
    }

    if position < prompt.len() {
        decode_context = context.decode_text(&prompt[position..], decode_context)?;
    }

    Ok(decode_context)
}

/// Finds the marker occurring earliest in `prompt[from..]`, returning its absolute byte offset.
fn next_marker(
    prompt: &str,
    from: usize,
    attachments: &HashMap<String, PromptAttachment>,
) -> Result<(usize, String), ContextError> {
    let rest = &prompt[from..];
    let mut earliest: Option<(usize, &str)> = None;

    for marker in attachments.keys() {
        if marker.is_empty() {
            return Err(ContextError::EmptyMarker);
        }

        let Some(offset) = rest.find(marker.as_str()) else {
            return Err(ContextError::MissingMarker(marker.clone()));
        };

        match earliest {
            Some((best, other)) if best == offset => {
                let (a, b) = if other < marker.as_str() {
                    (other, marker.as_str())
                } else {
                    (marker.as_str(), other)
                };
                return Err(ContextError::OverlappingMarkers(a.to_string(), b.to_string()));
            }
            Some((best, _)) if best < offset => {}
            _ => earliest = Some((offset, marker)),
        }
    }

    match earliest {
        Some((offset, marker)) => Ok((from + offset, marker.to_string())),
        None => Err(ContextError::MissingMarker(String::new())),
    }
}
