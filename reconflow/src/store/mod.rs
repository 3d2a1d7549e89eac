//! Artifact store: a directory-keyed registry of subject artifacts.
//!
//! Every subject owns `<subjects_dir>/<subject_id>`. Artifacts inside that
//! tree resolve through a default layout (FreeSurfer conventions), which an
//! engine may override; externally supplied inputs must be registered.

use crate::core::{ArtifactKey, SharedState};
use crate::errors::ArtifactConflictError;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::path::{Path, PathBuf};

/// A subject being reconstructed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subject {
    id: String,
    subjects_dir: PathBuf,
}

impl Subject {
    /// Creates a new subject handle.
    #[must_use]
    pub fn new(id: impl Into<String>, subjects_dir: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            subjects_dir: subjects_dir.into(),
        }
    }

    /// Returns the subject id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns the subjects directory.
    #[must_use]
    pub fn subjects_dir(&self) -> &Path {
        &self.subjects_dir
    }

    /// Returns the subject's own directory.
    #[must_use]
    pub fn dir(&self) -> PathBuf {
        self.subjects_dir.join(&self.id)
    }

    /// Returns the shared state a stage operating on this subject reports.
    #[must_use]
    pub fn shared_state(&self) -> SharedState {
        SharedState::new(self.subjects_dir.clone(), self.id.clone())
    }
}

/// Returns the default subject-relative location of an artifact.
///
/// External inputs have no default location.
#[must_use]
pub fn default_relative_path(key: &ArtifactKey) -> Option<PathBuf> {
    let rel = match key {
        ArtifactKey::SubjectDir => String::new(),
        ArtifactKey::ReconT1 => "mri/T1.mgz".to_string(),
        ArtifactKey::InjectedBrainmask => "mri/brainmask.mgz".to_string(),
        ArtifactKey::ReconAseg => "mri/aseg.mgz".to_string(),
        ArtifactKey::ReconAparcAseg => "mri/aparc+aseg.mgz".to_string(),
        ArtifactKey::ReconSurface(h, k) => format!("surf/{h}.{k}"),
        ArtifactKey::FsnativeToT1w => "mri/transforms/fsnative2t1w.lta".to_string(),
        ArtifactKey::T1wToFsnative => "mri/transforms/t1w2fsnative.lta".to_string(),
        ArtifactKey::Surface(h, k) => format!("surf/{h}.{k}.surf.gii"),
        ArtifactKey::Aseg => "mri/aseg.native.nii.gz".to_string(),
        ArtifactKey::AparcAseg => "mri/aparc+aseg.native.nii.gz".to_string(),
        ArtifactKey::Brainmask => "mri/brainmask.consensus.nii.gz".to_string(),
        ArtifactKey::Custom(rel) => rel.clone(),
        ArtifactKey::T1w
        | ArtifactKey::T2w
        | ArtifactKey::Flair
        | ArtifactKey::SkullStrippedT1w
        | ArtifactKey::CorrectedT1w
        | ArtifactKey::ExternalMask => return None,
    };
    Some(PathBuf::from(rel))
}

/// Registry mapping `(subject, artifact)` to file-system paths.
///
/// The store is the only shared mutable resource of a pipeline run. Each
/// stage owns its declared outputs for the duration of its run, so
/// registration conflicts indicate a wiring error rather than a race.
#[derive(Debug)]
pub struct ArtifactStore {
    subjects_dir: PathBuf,
    entries: DashMap<(String, ArtifactKey), PathBuf>,
    layout: DashMap<ArtifactKey, PathBuf>,
}

impl ArtifactStore {
    /// Creates a store rooted at a subjects directory.
    #[must_use]
    pub fn new(subjects_dir: impl Into<PathBuf>) -> Self {
        Self {
            subjects_dir: subjects_dir.into(),
            entries: DashMap::new(),
            layout: DashMap::new(),
        }
    }

    /// Returns the subjects directory.
    #[must_use]
    pub fn subjects_dir(&self) -> &Path {
        &self.subjects_dir
    }

    /// Returns a handle to a subject rooted in this store.
    #[must_use]
    pub fn subject(&self, id: impl Into<String>) -> Subject {
        Subject::new(id, self.subjects_dir.clone())
    }

    /// Overrides the subject-relative location of an artifact for all subjects.
    pub fn set_layout(&self, key: ArtifactKey, relative: impl Into<PathBuf>) {
        self.layout.insert(key, relative.into());
    }

    /// Registers an artifact path.
    ///
    /// Registering the same path twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if a different path is already registered.
    pub fn register(
        &self,
        subject_id: &str,
        key: ArtifactKey,
        path: impl Into<PathBuf>,
    ) -> Result<(), ArtifactConflictError> {
        let path = path.into();
        match self.entries.entry((subject_id.to_string(), key.clone())) {
            Entry::Occupied(existing) if *existing.get() != path => Err(ArtifactConflictError {
                subject: subject_id.to_string(),
                artifact: key,
                existing: existing.get().display().to_string(),
                requested: path.display().to_string(),
            }),
            Entry::Occupied(_) => Ok(()),
            Entry::Vacant(slot) => {
                slot.insert(path);
                Ok(())
            }
        }
    }

    /// Resolves the path of an artifact.
    ///
    /// Registered paths win; otherwise the layout determines the location.
    #[must_use]
    pub fn resolve(&self, subject_id: &str, key: &ArtifactKey) -> Option<PathBuf> {
        if let Some(path) = self.entries.get(&(subject_id.to_string(), key.clone())) {
            return Some(path.value().clone());
        }
        let relative = self
            .layout
            .get(key)
            .map(|rel| rel.value().clone())
            .or_else(|| default_relative_path(key))?;
        let dir = self.subjects_dir.join(subject_id);
        if relative.as_os_str().is_empty() {
            Some(dir)
        } else {
            Some(dir.join(relative))
        }
    }

    /// Returns true if the artifact resolves to an existing path.
    #[must_use]
    pub fn exists(&self, subject_id: &str, key: &ArtifactKey) -> bool {
        self.resolve(subject_id, key).is_some_and(|p| p.exists())
    }

    /// Returns true if the artifact was explicitly registered.
    #[must_use]
    pub fn is_registered(&self, subject_id: &str, key: &ArtifactKey) -> bool {
        self.entries.contains_key(&(subject_id.to_string(), key.clone()))
    }

    /// Returns the registered artifacts of a subject, sorted by key.
    #[must_use]
    pub fn entries(&self, subject_id: &str) -> Vec<(ArtifactKey, PathBuf)> {
        let mut entries: Vec<_> = self
            .entries
            .iter()
            .filter(|e| e.key().0 == subject_id)
            .map(|e| (e.key().1.clone(), e.value().clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }
}
