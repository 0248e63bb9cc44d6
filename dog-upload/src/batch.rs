use std::collections::HashSet;
use std::sync::Arc;

use tracing::debug;

use crate::resolver::resolve_with_extension;
use crate::{
    BatchId, NameResolver, RawUpload, UploadCandidate, UploadError, UploadResult,
    WindowsStyleResolver,
};

/// Default ceiling on resolver attempts for one name
pub const DEFAULT_MAX_NAME_ATTEMPTS: u32 = 10_000;

/// Identity name transform for [`UploadBatch::bulk_build`]
pub fn same_name(file_name: &str) -> String {
    file_name.to_string()
}

/// Ordered collection of candidates with pairwise distinct save names.
///
/// Collisions are settled on insertion with the batch's [`NameResolver`]
/// (default: `"name (n).ext"`), and against names already present in a store
/// with [`resolve_against`](Self::resolve_against).
pub struct UploadBatch {
    id: BatchId,
    items: Vec<UploadCandidate>,
    names: HashSet<String>,
    resolver: Arc<dyn NameResolver>,
    max_attempts: u32,
}

/// Outcome of [`UploadBatch::bulk_build`]: the batch plus every input that
/// could not become a candidate.
pub struct BulkBuild {
    pub batch: UploadBatch,
    pub rejected: Vec<RejectedInput>,
}

/// Raw input that failed construction or insertion
#[derive(Debug)]
pub struct RejectedInput {
    pub index: usize,
    pub file_name: String,
    pub error: UploadError,
}

impl BulkBuild {
    /// Abort the whole batch if any input was rejected, returning the first error
    pub fn into_result(self) -> UploadResult<UploadBatch> {
        match self.rejected.into_iter().next() {
            Some(rejected) => Err(rejected.error),
            None => Ok(self.batch),
        }
    }
}

impl Default for UploadBatch {
    fn default() -> Self {
        Self::new()
    }
}

impl UploadBatch {
    /// Empty batch with the Windows style resolver
    pub fn new() -> Self {
        Self {
            id: BatchId::new(),
            items: Vec::new(),
            names: HashSet::new(),
            resolver: Arc::new(WindowsStyleResolver),
            max_attempts: DEFAULT_MAX_NAME_ATTEMPTS,
        }
    }

    /// Replace the resolver used for later insertions and resolutions
    pub fn with_resolver<R: NameResolver + 'static>(mut self, resolver: R) -> Self {
        self.set_resolver(resolver);
        self
    }

    pub fn set_resolver<R: NameResolver + 'static>(&mut self, resolver: R) {
        self.resolver = Arc::new(resolver);
    }

    /// Ceiling on resolver attempts for a single name (at least 1)
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.set_max_attempts(attempts);
        self
    }

    pub fn set_max_attempts(&mut self, attempts: u32) {
        self.max_attempts = attempts.max(1);
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Build a batch from raw inputs.
    ///
    /// Each input's save name is `name_transform(file_name)`; `factory` turns the
    /// input into a candidate (usually [`UploadCandidate::from_raw`] or
    /// [`UploadCandidate::image_from_raw`]). Inputs that fail are collected in
    /// [`BulkBuild::rejected`] and do not affect their siblings.
    pub fn bulk_build<R, I, N, F>(inputs: I, name_transform: N, factory: F) -> BulkBuild
    where
        R: RawUpload,
        I: IntoIterator<Item = R>,
        N: FnMut(&str) -> String,
        F: FnMut(R, String) -> UploadResult<UploadCandidate>,
    {
        Self::new().extend_from_raw(inputs, name_transform, factory)
    }

    /// [`bulk_build`](Self::bulk_build) on an already configured batch
    pub fn extend_from_raw<R, I, N, F>(
        mut self,
        inputs: I,
        mut name_transform: N,
        mut factory: F,
    ) -> BulkBuild
    where
        R: RawUpload,
        I: IntoIterator<Item = R>,
        N: FnMut(&str) -> String,
        F: FnMut(R, String) -> UploadResult<UploadCandidate>,
    {
        let mut rejected = Vec::new();
        for (index, raw) in inputs.into_iter().enumerate() {
            let file_name = raw.file_name().to_string();
            let save_name = name_transform(&file_name);
            let outcome = factory(raw, save_name).and_then(|candidate| self.insert(candidate));
            if let Err(error) = outcome {
                debug!(
                    batch_id = %self.id,
                    index,
                    file_name = %file_name,
                    error = %error,
                    "Rejected raw input"
                );
                rejected.push(RejectedInput { index, file_name, error });
            }
        }

        BulkBuild { batch: self, rejected }
    }

    /// Append a candidate, renaming it first if its save name is taken.
    /// On error the batch is left unchanged.
    pub fn insert(&mut self, mut candidate: UploadCandidate) -> UploadResult<()> {
        let requested = candidate.save_name().to_string();
        if !self.has_unique_name(&requested) {
            let names = &self.names;
            let resolved = self.next_free_name(&requested, |name| names.contains(name))?;
            debug!(
                batch_id = %self.id,
                requested = %requested,
                resolved = %resolved,
                "Renamed duplicate save name"
            );
            candidate.set_save_name(resolved);
        }

        self.names.insert(candidate.save_name().to_string());
        self.items.push(candidate);
        Ok(())
    }

    /// True iff no member holds `name` as its save name
    pub fn has_unique_name(&self, name: &str) -> bool {
        !self.names.contains(name)
    }

    /// True iff none of `external` is a member's save name
    pub fn all_unique<S: AsRef<str>>(&self, external: &[S]) -> bool {
        external.iter().all(|name| self.has_unique_name(name.as_ref()))
    }

    /// Rename every member whose save name appears in `external`. A new name
    /// must be free both inside the batch and in `external`. Attempts restart
    /// at 1 from the member's requested name, so repeated passes stay at
    /// `"name (n)"` rather than nesting suffixes.
    ///
    /// Either every colliding member is renamed or, on error, none is.
    pub fn resolve_against<S: AsRef<str>>(&mut self, external: &[S]) -> UploadResult<usize> {
        let external: HashSet<&str> = external.iter().map(|name| name.as_ref()).collect();
        let mut names = self.names.clone();
        let mut renames = Vec::new();

        for (index, candidate) in self.items.iter().enumerate() {
            let current = candidate.save_name();
            if !external.contains(current) {
                continue;
            }

            let resolved = self.next_free_name(candidate.requested_name(), |name| {
                names.contains(name) || external.contains(name)
            })?;
            names.remove(current);
            names.insert(resolved.clone());
            renames.push((index, resolved));
        }

        let renamed = renames.len();
        for (index, resolved) in renames {
            let candidate = &mut self.items[index];
            debug!(
                batch_id = %self.id,
                previous = %candidate.save_name(),
                resolved = %resolved,
                "Resolved save name against existing names"
            );
            candidate.set_save_name(resolved);
        }
        self.names = names;

        Ok(renamed)
    }

    fn next_free_name<F>(&self, requested: &str, is_taken: F) -> UploadResult<String>
    where
        F: Fn(&str) -> bool,
    {
        for attempt in 1..=self.max_attempts {
            let proposal = resolve_with_extension(self.resolver.as_ref(), requested, attempt);
            if !is_taken(&proposal) {
                return Ok(proposal);
            }
        }
        Err(UploadError::exhausted(requested, self.max_attempts))
    }

    pub fn id(&self) -> &BatchId {
        &self.id
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&UploadCandidate> {
        self.items.get(index)
    }

    pub(crate) fn get_mut(&mut self, index: usize) -> Option<&mut UploadCandidate> {
        self.items.get_mut(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, UploadCandidate> {
        self.items.iter()
    }

    /// Save names in batch order
    pub fn save_names(&self) -> Vec<&str> {
        self.items.iter().map(UploadCandidate::save_name).collect()
    }

    /// Consume the batch, returning its candidates in order
    pub fn into_candidates(self) -> Vec<UploadCandidate> {
        self.items
    }
}

impl<'a> IntoIterator for &'a UploadBatch {
    type Item = &'a UploadCandidate;
    type IntoIter = std::slice::Iter<'a, UploadCandidate>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}

impl std::fmt::Debug for UploadBatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadBatch")
            .field("id", &self.id)
            .field("items", &self.items)
            .field("max_attempts", &self.max_attempts)
            .finish()
    }
}
