//! Skill prior.
use super::{sample_rows, SkillPriorConfig};
use crate::{
    transformer::{prefix_causal_mask, Block, LayerNorm},
    util::check_dims,
};
use anyhow::Result;
use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{embedding, linear, linear_no_bias, Embedding, Init, Linear, VarBuilder};
use log::info;
use quest_core::error::QuestError;
use rand::Rng;

/// Maps flattened skill-token indices to quantized codes.
pub trait CodeLookup {
    /// `(batch, len)` u32 indices -> `(batch, len, code_dim)` codes.
    fn indices_to_codes(&self, indices: &Tensor) -> Result<Tensor>;
}

/// Token history fed to [`SkillPrior::forward_t`].
pub enum SkillInput {
    /// Token indices, `(batch, len)` of `u32`.
    Indices(Tensor),

    /// Quantized codes, `(batch, len, code_dim)` of `f32`.
    Codes(Tensor),
}

impl SkillInput {
    fn dims2(&self) -> Result<(usize, usize)> {
        match self {
            Self::Indices(t) => Ok(t.dims2()?),
            Self::Codes(t) => {
                let (b, l, _) = t.dims3()?;
                Ok((b, l))
            }
        }
    }
}

fn rows_to_tensor(rows: &[Vec<u32>], device: &Device) -> Result<Tensor> {
    let len = rows.first().map(|r| r.len()).unwrap_or_default();
    Ok(Tensor::from_vec(rows.concat(), (rows.len(), len), device)?)
}

/// Causal transformer predicting the next skill token.
///
/// The input sequence is the context followed by the token history. Context
/// positions attend to the context only, so the logits of token `i` depend on the
/// whole context and the tokens up to `i`.
pub struct SkillPrior {
    config: SkillPriorConfig,
    tok_emb: Embedding,
    code_emb: Option<Linear>,
    tok_pos: Tensor,
    context_pos: Tensor,
    blocks: Vec<Block>,
    ln_f: LayerNorm,
    head: Linear,
}

impl SkillPrior {
    /// Builds the prior with variables registered under `vb`.
    pub fn build(vb: VarBuilder, config: SkillPriorConfig) -> Result<Self> {
        config.check()?;
        let n_embd = config.n_embd;
        let pos_init = Init::Randn {
            mean: 0.0,
            stdev: 0.02,
        };
        let block_config = config.block_config();
        let blocks = (0..config.n_layer)
            .map(|i| Block::new(&block_config, vb.pp("blocks").pp(i.to_string())))
            .collect::<Result<Vec<_>>>()?;
        let code_emb = match config.direct_skill_tokens {
            true => Some(linear(config.code_dim, n_embd, vb.pp("code_emb"))?),
            false => None,
        };
        info!(
            "Build skill prior: {} layers, {} heads, vocabulary {}+1, {} tokens",
            config.n_layer, config.n_head, config.vocab_size, config.block_size
        );

        Ok(Self {
            tok_emb: embedding(config.output_vocab_size(), n_embd, vb.pp("tok_emb"))?,
            code_emb,
            tok_pos: vb.get_with_hints((config.block_size, n_embd), "tok_pos", pos_init)?,
            context_pos: vb.get_with_hints((config.context_len, n_embd), "context_pos", pos_init)?,
            blocks,
            ln_f: LayerNorm::new(n_embd, 1e-5, vb.pp("ln_f"))?,
            head: linear_no_bias(n_embd, config.output_vocab_size(), vb.pp("head"))?,
            config,
        })
    }

    /// Returns the configuration.
    pub fn config(&self) -> &SkillPriorConfig {
        &self.config
    }

    /// The reserved token starting every sequence, outside the valid codebook range.
    pub fn start_token(&self) -> u32 {
        self.config.start_token()
    }

    /// Returns `true` if codes, not indices, are fed back into the model.
    pub fn direct_skill_tokens(&self) -> bool {
        self.config.direct_skill_tokens
    }

    /// Number of logits per position.
    pub fn output_vocab_size(&self) -> usize {
        self.config.output_vocab_size()
    }

    /// Input of the start position, in the representation of the token history.
    ///
    /// In the code representation it is a vector filled with the start token.
    pub fn start_input(&self, batch_size: usize, device: &Device) -> Result<SkillInput> {
        let start = self.start_token();
        match self.config.direct_skill_tokens {
            false => Ok(SkillInput::Indices(Tensor::full(
                start,
                (batch_size, 1),
                device,
            )?)),
            true => Ok(SkillInput::Codes(Tensor::full(
                start as f32,
                (batch_size, 1, self.config.code_dim),
                device,
            )?)),
        }
    }

    /// Builds the teacher-forcing input: the start token followed by all target
    /// tokens but the last.
    pub fn shift_right(&self, codes: &Tensor, indices: &Tensor) -> Result<SkillInput> {
        let (b, l) = indices.dims2()?;
        let start = self.start_input(b, indices.device())?;
        match start {
            SkillInput::Indices(start) => {
                let x = Tensor::cat(&[&start, &indices.narrow(1, 0, l - 1)?], 1)?;
                Ok(SkillInput::Indices(x))
            }
            SkillInput::Codes(start) => {
                let x = Tensor::cat(&[&start, &codes.narrow(1, 0, l - 1)?], 1)?;
                Ok(SkillInput::Codes(x))
            }
        }
    }

    fn embed(&self, input: &SkillInput) -> Result<Tensor> {
        match (input, &self.code_emb) {
            (SkillInput::Indices(ix), _) => Ok(self.tok_emb.forward(ix)?),
            (SkillInput::Codes(codes), Some(code_emb)) => {
                let (b, l, _) = codes.dims3()?;
                check_dims("codes", codes, &[b, l, self.config.code_dim])?;
                Ok(code_emb.forward(codes)?)
            }
            (SkillInput::Codes(_), None) => Err(QuestError::config(
                "codes are given to a skill prior built without direct_skill_tokens",
            )
            .into()),
        }
    }

    /// Returns logits of shape `(batch, len, vocab_size + 1)`.
    ///
    /// `context` has shape `(batch, n_context, n_embd)` with `n_context <= context_len`
    /// and the token history has `len <= block_size` positions.
    pub fn forward_t(&self, input: &SkillInput, context: &Tensor, train: bool) -> Result<Tensor> {
        let (b, l) = input.dims2()?;
        let (_, c, _) = context.dims3()?;
        check_dims("context", context, &[b, c, self.config.n_embd])?;
        if c > self.config.context_len || l > self.config.block_size {
            return Err(QuestError::shape(
                "prior sequence",
                &[self.config.context_len, self.config.block_size],
                &[c, l],
            )
            .into());
        }

        let ctx = context.broadcast_add(&self.context_pos.narrow(0, 0, c)?)?;
        let tok = self
            .embed(input)?
            .broadcast_add(&self.tok_pos.narrow(0, 0, l)?)?;
        let mut x = Tensor::cat(&[&ctx, &tok], 1)?;
        if train && self.config.dropout > 0.0 {
            x = candle_nn::ops::dropout(&x, self.config.dropout)?;
        }

        let mask = prefix_causal_mask(c, l, context.device())?;
        for block in self.blocks.iter() {
            x = block.forward_t(&x, Some(&mask), train)?;
        }
        let x = self.ln_f.forward(&x.narrow(1, c, l)?)?;
        Ok(self.head.forward(&x)?)
    }

    /// Samples a full sequence of `block_size` tokens for the given context.
    ///
    /// Each step keeps the `beam_size` largest logits among the first `codebook_size`,
    /// divides them by the temperature and samples. With `direct_skill_tokens`, the
    /// sampled tokens are mapped to codes with `lookup` before being fed back.
    /// Returns `(batch, block_size)` u32 indices.
    pub fn get_indices_top_k<R: Rng + ?Sized>(
        &self,
        context: &Tensor,
        codebook_size: usize,
        lookup: &dyn CodeLookup,
        rng: &mut R,
    ) -> Result<Tensor> {
        let context = context.detach();
        let (b, _, _) = context.dims3()?;
        let device = context.device();
        let codebook_size = codebook_size.min(self.config.vocab_size);
        let start = self.start_input(b, device)?;
        let mut sampled: Vec<Vec<u32>> = vec![Vec::with_capacity(self.config.block_size); b];

        for i in 0..self.config.block_size {
            let input = match (&start, i) {
                (_, 0) => self.start_input(b, device)?,
                (SkillInput::Indices(start), _) => {
                    let prev = rows_to_tensor(&sampled, device)?;
                    SkillInput::Indices(Tensor::cat(&[start, &prev], 1)?)
                }
                (SkillInput::Codes(start), _) => {
                    let prev = lookup.indices_to_codes(&rows_to_tensor(&sampled, device)?)?;
                    SkillInput::Codes(Tensor::cat(&[start, &prev.to_dtype(DType::F32)?], 1)?)
                }
            };
            let logits = self
                .forward_t(&input, &context, false)?
                .narrow(1, i, 1)?
                .squeeze(1)?
                .narrow(1, 0, codebook_size)?;
            let next = sample_rows(
                &logits,
                Some(self.config.beam_size),
                self.config.temperature,
                rng,
            )?;
            sampled.iter_mut().zip(next).for_each(|(s, n)| s.push(n));
        }

        rows_to_tensor(&sampled, device)
    }
}
