//! Greedy autoregressive decoding
//!
//! Each step runs the full sequence through the model, takes the argmax of
//! the last position's logits and appends it. There is no key/value cache:
//! weights are read from the checkpoint on every step, which keeps memory
//! flat at the cost of speed.

use crate::error::{Error, Result};
use crate::model::GPT2;
use std::ops::ControlFlow;

/// How many tokens fit after `prompt_len` in the context window
///
/// # Returns
///
/// `n_ctx - prompt_len`, or [`Error::PromptTooLong`] if that is zero
pub fn room_left(prompt_len: usize, n_ctx: usize) -> Result<usize> {
    if prompt_len >= n_ctx {
        return Err(Error::PromptTooLong {
            len: prompt_len,
            n_ctx,
        });
    }
    Ok(n_ctx - prompt_len)
}

/// Greedily extend `prompt` by up to `n_tokens` tokens
///
/// `callback` sees every new id as soon as it is chosen and may return
/// [`ControlFlow::Break`] to stop early. The id passed to a breaking callback
/// is still part of the result.
///
/// # Arguments
///
/// * `model` - Model to decode with
/// * `prompt` - Encoded prompt, non-empty
/// * `n_tokens` - Upper bound on new tokens; clamped to the room left in the
///   context window
/// * `callback` - Called once per generated id
///
/// # Returns
///
/// The generated ids, without the prompt
pub fn generate<F>(model: &GPT2, prompt: &[usize], n_tokens: usize, mut callback: F) -> Result<Vec<usize>>
where
    F: FnMut(usize) -> ControlFlow<()>,
{
    if prompt.is_empty() {
        return Err(Error::EmptyPrompt);
    }
    let n_tokens = n_tokens.min(room_left(prompt.len(), model.hparams().n_ctx)?);
    log::debug!("generating up to {} tokens after a {}-token prompt", n_tokens, prompt.len());

    let mut tokens = prompt.to_vec();
    let mut generated = Vec::with_capacity(n_tokens);

    for _ in 0..n_tokens {
        let logits = model.forward(&tokens)?;
        let next = logits.argmax_row(tokens.len() - 1);

        tokens.push(next);
        generated.push(next);

        if callback(next).is_break() {
            log::debug!("generation stopped by caller after {} tokens", generated.len());
            break;
        }
    }

    Ok(generated)
}
