use crate::input::FuzzInput;
use log::debug;
use rand::Rng;
use std::collections::{BTreeSet, HashMap};
use thiserror::Error;

/// Defines errors that can arise during corpus operations.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum CorpusError {
    /// The requested input ID was not found within the corpus.
    #[error("Input ID {0} not found in corpus")]
    InputNotFound(usize),
}

/// The ordered collection of saved inputs plus the coverage responsibility index.
///
/// Insertion order is save order is identifier order: the input at position
/// `i` always has id `i`. The responsibility index maps every claimed
/// coverage point to the single saved input that currently owns it, and each
/// input's own responsibility set is kept in lockstep with that index.
#[derive(Debug, Default)]
pub struct Corpus {
    entries: Vec<FuzzInput>,
    responsible: HashMap<usize, usize>,
}

impl Corpus {
    /// Creates a new, empty `Corpus`.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The identifier the next inserted input will receive.
    pub fn next_id(&self) -> usize {
        self.entries.len()
    }

    pub fn get(&self, id: usize) -> Option<&FuzzInput> {
        self.entries.get(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &FuzzInput> {
        self.entries.iter()
    }

    /// Selects a saved input uniformly at random, or `None` if the corpus is empty.
    pub fn random_select<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<&FuzzInput> {
        if self.entries.is_empty() {
            return None;
        }
        let index = rng.random_range(0..self.entries.len());
        self.entries.get(index)
    }

    /// Id of the input currently responsible for coverage point `index`.
    pub fn owner_of(&self, index: usize) -> Option<usize> {
        self.responsible.get(&index).copied()
    }

    /// Appends `input`, assigns its id, and transfers ownership of every
    /// point in `responsibilities` to it.
    ///
    /// Points already owned by an older input are stolen: they are removed
    /// from that input's set before the index is updated. The input is marked
    /// favored iff it claims at least one point.
    pub fn insert(&mut self, mut input: FuzzInput, responsibilities: BTreeSet<usize>) -> usize {
        let id = self.entries.len();
        for &point in &responsibilities {
            if let Some(previous) = self.responsible.insert(point, id) {
                if let Some(owned) = self
                    .entries
                    .get_mut(previous)
                    .and_then(|old| old.meta.responsibilities.as_mut())
                {
                    owned.remove(&point);
                }
                debug!("Input {id} steals responsibility for {point} from input {previous}");
            }
        }
        input.meta.id = Some(id);
        input.meta.favored = !responsibilities.is_empty();
        input.meta.responsibilities = Some(responsibilities);
        self.entries.push(input);
        id
    }

    /// Counts one more saved child for the input with id `parent`.
    pub fn record_offspring(&mut self, parent: usize) -> Result<(), CorpusError> {
        let entry = self
            .entries
            .get_mut(parent)
            .ok_or(CorpusError::InputNotFound(parent))?;
        entry.meta.offspring += 1;
        Ok(())
    }

    /// Sum of the responsibility set sizes over all saved inputs.
    pub fn responsibility_sum(&self) -> usize {
        self.entries.iter().map(FuzzInput::responsibility_count).sum()
    }

    pub fn favored_count(&self) -> usize {
        self.entries.iter().filter(|e| e.is_favored()).count()
    }
}
