//! Compiled-program cache.
//!
//! [`ProgramStore`] owns the loaded [`Program`]s, keyed by logical name, and
//! the [`CompiledProgram`]s built from them, keyed by the composite key
//! `"<program_name>_<canonical_build_options>"`. A composite key is compiled
//! at most once for the lifetime of the store: concurrent misses on the same
//! key serialise on a per-key gate and the losers observe the winner's entry.
//!
//! Every compiled program remembers the SHA-256 of the payload it was built
//! from. An entry whose digest differs from the payload now registered under
//! its name is evicted and rebuilt instead of being returned.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::driver::{ClObject, ContextId, DeviceId, Driver, ProgramId};
use crate::error::{ClError, Result, status};

/// Cache key of a compiled program.
pub fn composite_key(program_name: &str, options: &str) -> String {
    format!("{program_name}_{options}")
}

/// Source text or a prebuilt device binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgramPayload {
    Source(String),
    Binary(Vec<u8>),
}

impl ProgramPayload {
    pub const fn is_binary(&self) -> bool {
        matches!(self, Self::Binary(_))
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Source(text) => text.as_bytes(),
            Self::Binary(bytes) => bytes,
        }
    }

    /// SHA-256 of the payload bytes, as lowercase hex.
    pub fn digest(&self) -> String {
        hash_hex(self.as_bytes())
    }
}

pub(crate) fn hash_hex(data: &[u8]) -> String {
    Sha256::digest(data).iter().map(|b| format!("{b:02x}")).collect()
}

/// A named, immutable program payload.
#[derive(Debug, PartialEq, Eq)]
pub struct Program {
    name: String,
    payload: ProgramPayload,
}

impl Program {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub const fn payload(&self) -> &ProgramPayload {
        &self.payload
    }
}

/// A program built for one device with one option string.
///
/// The driver object is released when the last reference drops.
#[derive(Debug)]
pub struct CompiledProgram {
    key: String,
    program_name: String,
    options: String,
    source_hash: String,
    device: DeviceId,
    id: ProgramId,
    driver: Driver,
}

impl CompiledProgram {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn program_name(&self) -> &str {
        &self.program_name
    }

    pub fn options(&self) -> &str {
        &self.options
    }

    /// Digest of the payload this program was built from.
    pub fn source_hash(&self) -> &str {
        &self.source_hash
    }

    pub const fn device(&self) -> DeviceId {
        self.device
    }

    pub const fn id(&self) -> ProgramId {
        self.id
    }

    /// Device binary of this program.
    pub fn binary(&self) -> Result<Vec<u8>> {
        self.driver.program_binary(self.id)
    }
}

impl Drop for CompiledProgram {
    fn drop(&mut self) {
        self.driver.release_quietly(ClObject::Program(self.id));
    }
}

/// Program and compiled-program cache.
#[derive(Debug)]
pub struct ProgramStore {
    driver: Driver,
    programs: Mutex<HashMap<String, Arc<Program>>>,
    built: Mutex<HashMap<String, Arc<CompiledProgram>>>,
    build_gates: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    compilations: AtomicUsize,
}

impl ProgramStore {
    pub fn new(driver: Driver) -> Self {
        Self {
            driver,
            programs: Mutex::new(HashMap::new()),
            built: Mutex::new(HashMap::new()),
            build_gates: Mutex::new(HashMap::new()),
            compilations: AtomicUsize::new(0),
        }
    }

    pub const fn driver(&self) -> &Driver {
        &self.driver
    }

    fn programs(&self) -> Result<MutexGuard<'_, HashMap<String, Arc<Program>>>> {
        self.programs.lock().map_err(|e| ClError::poisoned(e, "program table"))
    }

    fn built(&self) -> Result<MutexGuard<'_, HashMap<String, Arc<CompiledProgram>>>> {
        self.built.lock().map_err(|e| ClError::poisoned(e, "compiled program table"))
    }

    /// Register `payload` under `name`, or return the program already
    /// registered there.
    ///
    /// Registering a different payload under a taken name is rejected.
    pub fn load_program(&self, name: &str, payload: ProgramPayload) -> Result<Arc<Program>> {
        let mut programs = self.programs()?;
        if let Some(existing) = programs.get(name) {
            if existing.payload != payload {
                return Err(ClError::ProgramConflict { name: name.to_owned() });
            }
            return Ok(Arc::clone(existing));
        }
        let program = Arc::new(Program { name: name.to_owned(), payload });
        programs.insert(name.to_owned(), Arc::clone(&program));
        Ok(program)
    }

    pub fn program(&self, name: &str) -> Result<Option<Arc<Program>>> {
        Ok(self.programs()?.get(name).cloned())
    }

    /// Return the compiled program for `(program_name, options)`, building
    /// it against `device` on the first request.
    pub fn build(
        &self,
        context: ContextId,
        device: DeviceId,
        program_name: &str,
        options: &str,
    ) -> Result<Arc<CompiledProgram>> {
        let key = composite_key(program_name, options);
        let program = self
            .program(program_name)?
            .ok_or_else(|| ClError::ProgramNotFound { name: program_name.to_owned() })?;
        let source_hash = program.payload.digest();

        if let Some(found) = self.lookup(&key, &source_hash)? {
            debug!(%key, "compiled program cache hit");
            return Ok(found);
        }

        let gate = {
            let mut gates = self.build_gates()?;
            Arc::clone(gates.entry(key.clone()).or_insert_with(|| Arc::new(Mutex::new(()))))
        };
        let _gate = gate.lock().map_err(|e| ClError::poisoned(e, "build gate"))?;

        if let Some(found) = self.lookup(&key, &source_hash)? {
            debug!(%key, "compiled program cache hit after wait");
            return Ok(found);
        }
        debug!(%key, "compiled program cache miss");

        let id = match &program.payload {
            ProgramPayload::Source(source) => self.driver.create_program_with_source(context, source)?,
            ProgramPayload::Binary(bytes) => self.driver.create_program_with_binary(context, device, bytes)?,
        };

        self.compilations.fetch_add(1, Ordering::SeqCst);
        if let Err(err) = self.driver.build_program(id, device, options) {
            let failure = if err.status_code() == status::CL_BUILD_PROGRAM_FAILURE {
                let log = self.driver.program_build_log(id, device).unwrap_or_default();
                warn!(program = program_name, options, log_len = log.len(), "program build failed");
                ClError::Compilation { program: program_name.to_owned(), options: options.to_owned(), log }
            } else {
                err
            };
            self.driver.release_quietly(ClObject::Program(id));
            return Err(failure);
        }
        info!(program = program_name, options, "compiled program");

        let compiled = Arc::new(CompiledProgram {
            key: key.clone(),
            program_name: program_name.to_owned(),
            options: options.to_owned(),
            source_hash,
            device,
            id,
            driver: self.driver.clone(),
        });
        self.built()?.insert(key.clone(), Arc::clone(&compiled));
        // Later requests hit the table first; waiters still hold their clone.
        self.build_gates()?.remove(&key);
        Ok(compiled)
    }

    /// The entry under `key` if it was built from the payload with
    /// `source_hash`. A stale entry is evicted.
    fn lookup(&self, key: &str, source_hash: &str) -> Result<Option<Arc<CompiledProgram>>> {
        let mut built = self.built()?;
        match built.get(key) {
            Some(found) if found.source_hash == source_hash => Ok(Some(Arc::clone(found))),
            Some(stale) => {
                warn!(%key, cached = %stale.source_hash, current = source_hash, "program source changed; rebuilding");
                built.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    fn build_gates(&self) -> Result<MutexGuard<'_, HashMap<String, Arc<Mutex<()>>>>> {
        self.build_gates.lock().map_err(|e| ClError::poisoned(e, "build gates"))
    }

    /// Install a previously exported binary under its exact composite key.
    ///
    /// `source_hash` is the digest of the payload the binary was built from;
    /// [`build`](Self::build) only returns the entry while the registered
    /// payload still has that digest.
    pub fn add_built_program(
        &self,
        context: ContextId,
        device: DeviceId,
        program_name: &str,
        options: &str,
        source_hash: &str,
        binary: &[u8],
    ) -> Result<Arc<CompiledProgram>> {
        let key = composite_key(program_name, options);
        let id = self.driver.create_program_with_binary(context, device, binary)?;
        if let Err(err) = self.driver.build_program(id, device, options) {
            self.driver.release_quietly(ClObject::Program(id));
            return Err(err);
        }
        let compiled = Arc::new(CompiledProgram {
            key: key.clone(),
            program_name: program_name.to_owned(),
            options: options.to_owned(),
            source_hash: source_hash.to_owned(),
            device,
            id,
            driver: self.driver.clone(),
        });
        self.built()?.insert(key, Arc::clone(&compiled));
        Ok(compiled)
    }

    /// Drop every program and compiled program.
    ///
    /// Handles already created from a dropped entry stay valid.
    pub fn clear(&self) -> Result<()> {
        let dropped = {
            let mut built = self.built()?;
            let n = built.len();
            built.clear();
            n
        };
        self.programs()?.clear();
        self.build_gates()?.clear();
        debug!(dropped, "cleared program store");
        Ok(())
    }

    /// Every compiled program, by composite key.
    pub fn all_compiled(&self) -> Result<BTreeMap<String, Arc<CompiledProgram>>> {
        Ok(self.built()?.iter().map(|(k, v)| (k.clone(), Arc::clone(v))).collect())
    }

    /// Device binaries of every compiled program, by composite key.
    pub fn export_binaries(&self) -> Result<BTreeMap<String, Vec<u8>>> {
        self.all_compiled()?
            .into_iter()
            .map(|(key, program)| Ok((key, program.binary()?)))
            .collect()
    }

    /// Number of builds started by [`ProgramStore::build`] cache misses.
    pub fn compilations(&self) -> usize {
        self.compilations.load(Ordering::SeqCst)
    }
}
