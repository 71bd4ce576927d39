use crate::model::Snapshot;
use async_trait::async_trait;
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tempfile::NamedTempFile;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    #[error("corrupt snapshot in {location}: {reason}")]
    Corrupt { location: String, reason: String },
    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("serializing snapshot: {0}")]
    Serialize(#[from] serde_json::Error),
    /// Le snapshot persisté a changé depuis le chargement.
    #[error("revision conflict: expected {expected}, found {found}")]
    Conflict { expected: u64, found: u64 },
    /// La sauvegarde a été abandonnée (délai dépassé) avant publication.
    #[error("save abandoned before commit")]
    Abandoned,
}

/// Condition posée sur l'état persisté au moment de l'écriture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WritePrecondition {
    /// Écrase sans condition.
    Any,
    /// N'écrit que si le snapshot persisté porte encore cette révision.
    MatchesRevision(u64),
}

impl WritePrecondition {
    pub fn check(self, found: u64) -> Result<(), StorageError> {
        match self {
            WritePrecondition::MatchesRevision(expected) if expected != found => {
                Err(StorageError::Conflict { expected, found })
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
pub trait Storage: Send + Sync {
    /// Charge le snapshot courant.
    async fn load(&self) -> Result<Snapshot, StorageError>;
    /// Sauvegarde de manière atomique : tout le snapshot ou l'ancien intact.
    /// Rien n'est écrit si `precondition` n'est plus vérifiée.
    async fn save(&self, snapshot: &Snapshot, precondition: WritePrecondition) -> Result<(), StorageError>;
}

/// Point de publication partagé entre une sauvegarde et sa tâche bloquante.
///
/// Une fois abandonnée, la tâche ne publie plus rien ; l'abandon attend la
/// fin d'une publication déjà commencée.
#[derive(Debug, Clone, Default)]
struct CommitGate(Arc<Mutex<bool>>);

impl CommitGate {
    fn abandon(&self) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = true;
    }

    fn publish<T>(&self, publish: impl FnOnce() -> Result<T, StorageError>) -> Result<T, StorageError> {
        let abandoned = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        if *abandoned {
            return Err(StorageError::Abandoned);
        }
        publish()
    }
}

/// Abandonne la sauvegarde si le futur est lâché avant la fin (délai dépassé).
struct AbandonOnDrop {
    gate: CommitGate,
    armed: bool,
}

impl AbandonOnDrop {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for AbandonOnDrop {
    fn drop(&mut self) {
        if self.armed {
            self.gate.abandon();
        }
    }
}

/// Snapshot JSON sur disque ; un fichier absent vaut un snapshot vide.
///
/// Les écritures passent par un verrou exclusif sur `<snapshot>.lock`,
/// partagé avec les sessions ouvertes par [`JsonStorage::lock`].
#[derive(Debug, Clone)]
pub struct JsonStorage {
    path: PathBuf,
}

impl JsonStorage {
    pub fn open<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lock_path(&self) -> PathBuf {
        let mut name = self.path.clone().into_os_string();
        name.push(".lock");
        PathBuf::from(name)
    }

    /// Ouvre une session exclusive : aucun autre écrivain (processus ou
    /// coordinateur) ne touche au snapshot tant qu'elle est vivante.
    pub async fn lock(&self) -> Result<SnapshotLock, StorageError> {
        let path = self.path.clone();
        let lock_path = self.lock_path();
        let file = tokio::task::spawn_blocking(move || acquire(&lock_path))
            .await
            .map_err(|err| StorageError::Unavailable(err.to_string()))??;
        Ok(SnapshotLock { path, _file: file })
    }

    fn read_blocking(path: &Path) -> Result<Snapshot, StorageError> {
        let data = match std::fs::read(path) {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Snapshot::default())
            }
            Err(source) => {
                return Err(StorageError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        let snapshot: Snapshot =
            serde_json::from_slice(&data).map_err(|err| StorageError::Corrupt {
                location: path.display().to_string(),
                reason: err.to_string(),
            })?;
        snapshot.validate().map_err(|reason| StorageError::Corrupt {
            location: path.display().to_string(),
            reason,
        })?;
        Ok(snapshot)
    }

    /// Écrit `json` à la place du snapshot. Le verrou doit être tenu.
    fn write_blocking(
        path: &Path,
        json: &[u8],
        precondition: WritePrecondition,
        gate: &CommitGate,
    ) -> Result<(), StorageError> {
        let io_err = |source| StorageError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let WritePrecondition::MatchesRevision(_) = precondition {
            precondition.check(Self::read_blocking(path)?.revision)?;
        }
        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        let mut tmp = NamedTempFile::new_in(dir).map_err(io_err)?;
        tmp.write_all(json).map_err(io_err)?;
        tmp.flush().map_err(io_err)?;
        tmp.as_file().sync_all().map_err(io_err)?;
        // abandonnée : `tmp` est supprimé en sortant, l'ancien fichier reste
        gate.publish(|| tmp.persist(path).map(drop).map_err(|err| io_err(err.error)))
    }

    async fn write(
        path: PathBuf,
        lock_path: Option<PathBuf>,
        snapshot: &Snapshot,
        precondition: WritePrecondition,
    ) -> Result<(), StorageError> {
        let json = serde_json::to_vec_pretty(snapshot)?;
        let gate = CommitGate::default();
        let guard = AbandonOnDrop {
            gate: gate.clone(),
            armed: true,
        };
        let written = tokio::task::spawn_blocking(move || {
            let _held = lock_path.as_deref().map(acquire).transpose()?;
            Self::write_blocking(&path, &json, precondition, &gate)
        })
        .await
        .map_err(|err| StorageError::Unavailable(err.to_string()))?;
        guard.disarm();
        written
    }
}

fn acquire(lock_path: &Path) -> Result<File, StorageError> {
    let io_err = |source| StorageError::Io {
        path: lock_path.to_path_buf(),
        source,
    };
    let file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(lock_path)
        .map_err(io_err)?;
    file.lock_exclusive().map_err(io_err)?;
    Ok(file)
}

#[async_trait]
impl Storage for JsonStorage {
    async fn load(&self) -> Result<Snapshot, StorageError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || Self::read_blocking(&path))
            .await
            .map_err(|err| StorageError::Unavailable(err.to_string()))?
    }

    async fn save(&self, snapshot: &Snapshot, precondition: WritePrecondition) -> Result<(), StorageError> {
        Self::write(self.path.clone(), Some(self.lock_path()), snapshot, precondition).await
    }
}

/// Session exclusive sur un [`JsonStorage`] ; le verrou est rendu au drop.
#[derive(Debug)]
pub struct SnapshotLock {
    path: PathBuf,
    _file: File,
}

impl SnapshotLock {
    pub async fn load(&self) -> Result<Snapshot, StorageError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || JsonStorage::read_blocking(&path))
            .await
            .map_err(|err| StorageError::Unavailable(err.to_string()))?
    }

    pub async fn save(&self, snapshot: &Snapshot, precondition: WritePrecondition) -> Result<(), StorageError> {
        JsonStorage::write(self.path.clone(), None, snapshot, precondition).await
    }
}

/// Stockage en mémoire (tests, exécutions éphémères).
#[derive(Debug, Default)]
pub struct MemoryStorage {
    inner: Mutex<Snapshot>,
}

impl MemoryStorage {
    pub fn new(snapshot: Snapshot) -> Self {
        Self {
            inner: Mutex::new(snapshot),
        }
    }

    /// Copie du snapshot actuellement stocké.
    pub fn current(&self) -> Snapshot {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn load(&self) -> Result<Snapshot, StorageError> {
        Ok(self.current())
    }

    async fn save(&self, snapshot: &Snapshot, precondition: WritePrecondition) -> Result<(), StorageError> {
        let mut guard = self
            .inner
            .lock()
            .map_err(|_| StorageError::Unavailable("memory storage poisoned".into()))?;
        precondition.check(guard.revision)?;
        *guard = snapshot.clone();
        Ok(())
    }
}
