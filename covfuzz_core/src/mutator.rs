use crate::corpus::Corpus;
use crate::input::{FuzzInput, GeneratedInput, GenerationLimits};
use rand::Rng;
use thiserror::Error;

/// Probability that a havoc batch zero-fills instead of randomizing.
pub const DEFAULT_ZERO_FILL_PROBABILITY: f64 = 0.1;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum MutationError {
    /// The parent has no materialized bytes, so no offset can be chosen.
    #[error("Cannot mutate an input with no bytes")]
    EmptyParent,
}

/// A `Mutator` derives a new child input from a saved parent.
///
/// # Type Parameters
/// * `R`: The random number generator driving mutation decisions.
pub trait Mutator<R: Rng + ?Sized> {
    fn name(&self) -> &'static str;

    /// Produces a child of `parent`. Only the parent's bytes and identifier are
    /// read; its coverage bookkeeping is never consulted or changed.
    ///
    /// # Arguments
    /// * `parent`: The saved input to derive from.
    /// * `corpus`: The saved inputs, giving recombining mutators a splice donor.
    /// * `rng`: The random number generator driving offsets, lengths and values.
    ///
    /// # Returns
    /// A `Result` containing a fresh child input that replays the mutated bytes,
    /// or a `MutationError` if `parent` cannot be mutated.
    fn mutate(
        &mut self,
        parent: &FuzzInput,
        corpus: &Corpus,
        rng: &mut R,
    ) -> Result<FuzzInput, MutationError>;
}

/// Samples a geometric distribution over `1..` with the given mean, clamped to `max`.
///
/// A mean at or below 1 always yields 1. Draws that would produce a
/// non-finite or huge magnitude are clamped rather than reproduced.
pub fn sample_geometric<R: Rng + ?Sized>(rng: &mut R, mean: f64, max: usize) -> usize {
    let max = max.max(1);
    if mean.is_nan() || mean <= 1.0 {
        return 1;
    }
    let p = 1.0 / mean;
    let uniform: f64 = rng.random();
    let value = ((1.0 - uniform).ln() / (1.0 - p).ln()).ceil();
    if !value.is_finite() || value < 1.0 {
        1
    } else if value >= max as f64 {
        max
    } else {
        value as usize
    }
}

/// Builds a splice child: `parent[..offset]` followed by `other[offset..]`.
///
/// The crossover point is the same offset on both sides.
pub fn splice_bytes(parent: &[u8], other: &[u8], offset: usize) -> Vec<u8> {
    let head = offset.min(parent.len());
    let mut child = Vec::with_capacity(head + other.len().saturating_sub(offset));
    child.extend_from_slice(&parent[..head]);
    if offset < other.len() {
        child.extend_from_slice(&other[offset..]);
    }
    child
}

fn source_tag(input: &FuzzInput) -> String {
    match input.id() {
        Some(id) => format!("{id:06}"),
        None => "unsaved".to_string(),
    }
}

fn id_tag(input: &FuzzInput) -> String {
    input
        .id()
        .map_or_else(|| "-1".to_string(), |id| id.to_string())
}

/// Batch random byte overwrite of a cloned parent.
#[derive(Debug, Clone)]
pub struct HavocMutator {
    pub mean_mutation_count: f64,
    pub mean_mutation_size: f64,
    /// Use `mean_mutation_size` as a fixed span instead of sampling it.
    pub constant_mutation_size: bool,
    pub zero_fill_probability: f64,
    pub limits: GenerationLimits,
}

impl HavocMutator {
    /// Clones `bytes` and applies one havoc batch in place.
    ///
    /// Returns the mutated buffer and the number of mutations applied.
    pub fn havoc_bytes<R: Rng + ?Sized>(
        &self,
        bytes: &[u8],
        rng: &mut R,
    ) -> Result<(Vec<u8>, usize), MutationError> {
        if bytes.is_empty() {
            return Err(MutationError::EmptyParent);
        }
        let mut child = bytes.to_vec();
        let num_mutations = sample_geometric(rng, self.mean_mutation_count, child.len());
        let set_to_zero = rng.random_bool(self.zero_fill_probability);

        for _ in 0..num_mutations {
            let offset = rng.random_range(0..child.len());
            let span = if self.constant_mutation_size {
                (self.mean_mutation_size as usize).max(1)
            } else {
                sample_geometric(rng, self.mean_mutation_size, child.len())
            };
            let end = offset.saturating_add(span).min(child.len());
            for byte in &mut child[offset..end] {
                *byte = if set_to_zero { 0 } else { rng.random() };
            }
        }
        Ok((child, num_mutations))
    }
}

impl<R: Rng + ?Sized> Mutator<R> for HavocMutator {
    fn name(&self) -> &'static str {
        "havoc"
    }

    fn mutate(
        &mut self,
        parent: &FuzzInput,
        _corpus: &Corpus,
        rng: &mut R,
    ) -> Result<FuzzInput, MutationError> {
        let (bytes, num_mutations) = self.havoc_bytes(parent.as_bytes(), rng)?;
        let generated = GeneratedInput::from_bytes(bytes, self.limits, rng.next_u64());
        let description = format!("src:{},havoc:{}", source_tag(parent), num_mutations);
        let mut child = FuzzInput::generated(generated, description);
        child.meta.parent = parent.id();
        Ok(child)
    }
}

/// Recombines the parent with a uniformly chosen corpus member.
#[derive(Debug, Clone)]
pub struct SpliceMutator {
    pub limits: GenerationLimits,
}

impl SpliceMutator {
    /// Splices `parent` with `other`, sampling a split offset on each side.
    ///
    /// Only the parent-side offset is used as the crossover point; the
    /// other-side draw is still taken so the random stream stays aligned.
    pub fn splice_with<R: Rng + ?Sized>(
        &self,
        parent: &FuzzInput,
        other: &FuzzInput,
        rng: &mut R,
    ) -> Result<FuzzInput, MutationError> {
        if parent.is_empty() || other.is_empty() {
            return Err(MutationError::EmptyParent);
        }
        let parent_offset = rng.random_range(0..parent.len());
        let _other_offset = rng.random_range(0..other.len());
        let bytes = splice_bytes(parent.as_bytes(), other.as_bytes(), parent_offset);
        let generated = GeneratedInput::from_bytes(bytes, self.limits, rng.next_u64());
        let description = format!(
            "random,splice: id_{}&id_{}",
            id_tag(parent),
            id_tag(other)
        );
        let mut child = FuzzInput::generated(generated, description);
        child.meta.parent = parent.id();
        Ok(child)
    }
}

impl<R: Rng + ?Sized> Mutator<R> for SpliceMutator {
    fn name(&self) -> &'static str {
        "splice"
    }

    fn mutate(
        &mut self,
        parent: &FuzzInput,
        corpus: &Corpus,
        rng: &mut R,
    ) -> Result<FuzzInput, MutationError> {
        match corpus.random_select(rng) {
            Some(other) => self.splice_with(parent, other, rng),
            None => self.splice_with(parent, parent, rng),
        }
    }
}
