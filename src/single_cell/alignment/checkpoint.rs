use bincode::config;
use bincode::serde::{decode_from_slice, encode_to_vec};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

use crate::core::nn::linear::TensorSnapshot;
use crate::error::{AlignError, AlignResult};

///////////
// Types //
///////////

/// The two halves of a species model that can be stored and imported
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModelComponent {
    Encoder,
    Decoder,
}

impl ModelComponent {
    /// File stem of the component in a checkpoint directory
    pub fn file_stem(&self) -> &'static str {
        match self {
            ModelComponent::Encoder => "encoder",
            ModelComponent::Decoder => "decoder",
        }
    }
}

impl fmt::Display for ModelComponent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.file_stem())
    }
}

/// Stored parameters of one model component
///
/// ### Fields
///
/// * `species` - Species the parameters were trained on
/// * `component` - Encoder or decoder
/// * `latent_dim` - Latent width of the model
/// * `tensors` - The named parameter values
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ComponentSnapshot {
    pub species: String,
    pub component: ModelComponent,
    pub latent_dim: usize,
    pub tensors: Vec<TensorSnapshot>,
}

impl ComponentSnapshot {
    /// Look up a tensor by name
    pub fn tensor(&self, name: &str) -> Option<&TensorSnapshot> {
        self.tensors.iter().find(|t| t.name == name)
    }
}

///////////////
// Utilities //
///////////////

/// Serialise a value with bincode and write it atomically
///
/// The bytes go into a temporary file in the destination directory which is
/// renamed onto `path` once complete, so readers never see a partial file.
///
/// ### Params
///
/// * `path` - Destination file
/// * `value` - Any serialisable value
pub fn write_atomic<T: Serialize>(path: &Path, value: &T) -> AlignResult<()> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&dir)?;

    let bytes = encode_to_vec(value, config::standard())?;
    let mut tmp = NamedTempFile::new_in(&dir)?;
    tmp.write_all(&bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| AlignError::Io(e.error))?;

    Ok(())
}

/// Read a value written by `write_atomic`
pub fn read_bincode<T: DeserializeOwned>(path: &Path) -> AlignResult<T> {
    let bytes = fs::read(path)?;
    let (value, _) = decode_from_slice::<T, _>(&bytes, config::standard())?;
    Ok(value)
}

/// Persist any serialisable result object
///
/// ### Params
///
/// * `path` - Destination file; parent directories get created
/// * `results` - The result object
pub fn save_results<T: Serialize>(path: &Path, results: &T) -> AlignResult<()> {
    write_atomic(path, results)
}

/// Load a result object stored with `save_results`
pub fn load_results<T: DeserializeOwned>(path: &Path) -> AlignResult<T> {
    read_bincode(path)
}

/// Check that a tag names a single directory below the store root
///
/// ### Params
///
/// * `tag` - The checkpoint tag
///
/// ### Returns
///
/// `Ok(())` or a `Config` error for empty tags, path separators and `..`
pub fn check_tag(tag: &str) -> AlignResult<()> {
    if tag.is_empty() || tag == "." || tag.contains("..") || tag.contains(['/', '\\']) {
        return Err(AlignError::config(format!(
            "Invalid checkpoint tag '{}': must be a plain directory name",
            tag
        )));
    }
    Ok(())
}

///////////
// Store //
///////////

/// Directory backed store of model components
///
/// Layout is `<root>/<tag>/<component>.bin`.
#[derive(Clone, Debug)]
pub struct CheckpointStore {
    root: PathBuf,
}

impl CheckpointStore {
    /// Open (and create if needed) a store at `root`
    pub fn new(root: impl Into<PathBuf>) -> AlignResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_of(&self, tag: &str, component: ModelComponent) -> AlignResult<PathBuf> {
        check_tag(tag)?;
        Ok(self
            .root
            .join(tag)
            .join(format!("{}.bin", component.file_stem())))
    }

    /// Write a component snapshot under a tag, replacing any previous one
    pub fn save(&self, tag: &str, snapshot: &ComponentSnapshot) -> AlignResult<()> {
        write_atomic(&self.path_of(tag, snapshot.component)?, snapshot)
    }

    /// Load a component snapshot
    ///
    /// ### Returns
    ///
    /// The snapshot, `CheckpointNotFound` if nothing is stored or `Config`
    /// for an invalid tag.
    pub fn load(&self, tag: &str, component: ModelComponent) -> AlignResult<ComponentSnapshot> {
        let path = self.path_of(tag, component)?;
        if !path.is_file() {
            return Err(AlignError::CheckpointNotFound {
                tag: tag.to_string(),
                component: component.to_string(),
            });
        }
        read_bincode(&path)
    }

    pub fn contains(&self, tag: &str, component: ModelComponent) -> bool {
        self.path_of(tag, component)
            .map(|p| p.is_file())
            .unwrap_or(false)
    }
}

///////////
// Tests //
///////////
