//! Plugin discovery, loading and initialization.
//!
//! The pipeline runs exactly once, on the thread that won the trigger's
//! firing edge. Each candidate is loaded and initialized inside a fault
//! containment boundary; one plugin crashing in our hands must neither
//! abort the scan nor take the host process down. Every candidate ends up
//! in exactly one append-only record.

use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{info, warn};

use crate::config::DiscoveryKind;
use crate::diagnostics::DependencyWalker;
use crate::error::PreloadError;
use crate::fault::{record_fault, FaultDump, FaultInterceptor};
use crate::module::{InitOutcome, LoadedModule, ModuleError, ModuleHost, ModuleRef};

/// Final classification of one candidate.
///
/// `Loaded` and `Initialized` are the only success states: a plugin without
/// the initialization export is fine, it just has nothing to run early.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginStatus {
    Loaded,
    Initialized,
    FailedLoad,
    FailedInitialize,
}

impl PluginStatus {
    pub fn is_success(self) -> bool {
        matches!(self, PluginStatus::Loaded | PluginStatus::Initialized)
    }
}

/// One scanned candidate. Immutable once appended.
pub struct PluginRecord {
    pub path: PathBuf,
    pub status: PluginStatus,
    /// Present only for `Loaded`/`Initialized`; keeps the module mapped for
    /// the rest of the process lifetime.
    handle: Option<Box<dyn LoadedModule>>,
}

impl PluginRecord {
    pub fn is_retained(&self) -> bool {
        self.handle.is_some()
    }
}

/// How files in the plugin directory qualify as candidates.
#[derive(Debug, Clone)]
pub enum DiscoveryRule {
    /// `<stem><suffix>` marker file next to `<stem>.<dll ext>`.
    Marker { suffix: String },
    /// Passive inspection finds the named export.
    ExportProbe { export: String },
}

impl DiscoveryRule {
    pub fn from_config(kind: DiscoveryKind, marker_suffix: &str, initializer: &str) -> Self {
        match kind {
            DiscoveryKind::MarkerFile => DiscoveryRule::Marker {
                suffix: marker_suffix.to_string(),
            },
            DiscoveryKind::ExportProbe => DiscoveryRule::ExportProbe {
                export: initializer.to_string(),
            },
        }
    }
}

pub struct PluginPipeline {
    host: Arc<dyn ModuleHost>,
    directory: PathBuf,
    rule: DiscoveryRule,
    initializer: String,
    records: Vec<PluginRecord>,
    finished: bool,
}

impl PluginPipeline {
    pub fn new(
        host: Arc<dyn ModuleHost>,
        directory: PathBuf,
        rule: DiscoveryRule,
        initializer: String,
    ) -> Self {
        Self {
            host,
            directory,
            rule,
            initializer,
            records: Vec::new(),
            finished: false,
        }
    }

    pub fn records(&self) -> &[PluginRecord] {
        &self.records
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn loaded_count(&self) -> usize {
        self.records
            .iter()
            .filter(|r| r.status.is_success())
            .count()
    }

    /// Discover and load every candidate. A single plugin's failure never
    /// terminates the scan; on return, one record exists per candidate.
    pub fn run(&mut self) {
        info!(directory = %self.directory.display(), "searching directory for plugins");

        let candidates = self.discover();
        for path in candidates {
            let record = self.load_one(path);
            self.log_status(&record);
            self.records.push(record);
        }

        self.finished = true;
        info!(
            loaded = self.loaded_count(),
            scanned = self.records.len(),
            "plugin loading finished",
        );
    }

    /// Release every retained module. Called from process-detach teardown.
    pub fn unload_all(&mut self) {
        info!("unloading plugins");
        for record in &mut self.records {
            record.handle = None;
        }
    }

    /// Candidate paths in directory listing order. The order is whatever the
    /// filesystem reports and is not contractually significant.
    fn discover(&self) -> Vec<PathBuf> {
        let entries = match std::fs::read_dir(&self.directory) {
            Ok(entries) => entries,
            Err(error) => {
                warn!(directory = %self.directory.display(), %error, "couldn't enumerate plugin directory");
                return Vec::new();
            }
        };

        let mut candidates = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            match &self.rule {
                DiscoveryRule::Marker { suffix } => {
                    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                        continue;
                    };
                    let Some(stem) = name.strip_suffix(suffix.as_str()) else {
                        continue;
                    };
                    if stem.is_empty() {
                        continue;
                    }
                    let library = self
                        .directory
                        .join(stem)
                        .with_extension(std::env::consts::DLL_EXTENSION);
                    info!(
                        marker = %name,
                        library = %library.display(),
                        "preload directive found",
                    );
                    candidates.push(library);
                }
                DiscoveryRule::ExportProbe { export } => {
                    if path
                        .extension()
                        .and_then(|e| e.to_str())
                        .map_or(true, |e| !e.eq_ignore_ascii_case(std::env::consts::DLL_EXTENSION))
                    {
                        continue;
                    }
                    match self.host.inspect(ModuleRef::Path(&path)) {
                        Ok(metadata) if metadata.has_export(export) => {
                            info!(library = %path.display(), export = %export, "export probe matched");
                            candidates.push(path);
                        }
                        Ok(_) => {}
                        Err(ModuleError::InspectionUnsupported) => {
                            warn!(
                                library = %path.display(),
                                "export probing is unavailable on this platform, candidate skipped",
                            );
                        }
                        Err(error) => {
                            warn!(library = %path.display(), %error, "couldn't probe candidate");
                        }
                    }
                }
            }
        }
        candidates
    }

    fn load_one(&self, path: PathBuf) -> PluginRecord {
        info!(plugin = %path.display(), "trying to load");

        let host = Arc::clone(&self.host);
        let load_path = path.clone();
        let loaded = FaultInterceptor::contain(AssertUnwindSafe(move || host.load(&load_path)));

        let module = match loaded {
            Err(fault) => {
                record_fault(&FaultDump::from_contained(&fault, 0));
                let failure = PreloadError::ModuleLoadFailure {
                    path: path.clone(),
                    reason: fault.to_string(),
                };
                warn!(%failure, "fault raised while loading plugin library");
                self.diagnose(&path);
                return PluginRecord {
                    path,
                    status: PluginStatus::FailedLoad,
                    handle: None,
                };
            }
            Ok(Err(error)) => {
                let failure = PreloadError::ModuleLoadFailure {
                    path: path.clone(),
                    reason: error.to_string(),
                };
                warn!(%failure, "couldn't load plugin");
                self.diagnose(&path);
                return PluginRecord {
                    path,
                    status: PluginStatus::FailedLoad,
                    handle: None,
                };
            }
            Ok(Ok(module)) => module,
        };

        info!(plugin = %path.display(), "library is loaded, attempting the initialization routine");
        let outcome =
            FaultInterceptor::contain(AssertUnwindSafe(|| module.invoke_initializer(&self.initializer)));

        match outcome {
            Ok(InitOutcome::Missing) => PluginRecord {
                path,
                status: PluginStatus::Loaded,
                handle: Some(module),
            },
            Ok(InitOutcome::Ran) => PluginRecord {
                path,
                status: PluginStatus::Initialized,
                handle: Some(module),
            },
            Err(fault) => {
                record_fault(&FaultDump::from_contained(&fault, 0));
                let failure = PreloadError::InitializationFault {
                    path: path.clone(),
                    fault,
                };
                warn!(%failure, "fault raised inside plugin's initialization routine");
                // Unload rather than leave a half-initialized module mapped.
                drop(module);
                self.diagnose(&path);
                PluginRecord {
                    path,
                    status: PluginStatus::FailedInitialize,
                    handle: None,
                }
            }
        }
    }

    fn diagnose(&self, path: &Path) {
        let walker = DependencyWalker::new(self.host.as_ref());
        let reports = walker.inspect(path);
        if reports.is_empty() {
            info!(plugin = %path.display(), "no dependency information available");
        }
    }

    fn log_status(&self, record: &PluginRecord) {
        let name = record.path.display();
        match record.status {
            PluginStatus::Loaded => {
                info!(plugin = %name, "plugin loaded, no initialization routine present");
            }
            PluginStatus::Initialized => {
                info!(plugin = %name, "plugin loaded, initialization routine executed");
            }
            PluginStatus::FailedLoad => warn!(plugin = %name, "plugin failed to load"),
            PluginStatus::FailedInitialize => {
                warn!(plugin = %name, "plugin failed during initialization");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::ModuleMetadata;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Scripted behavior for one candidate path.
    #[derive(Clone, Copy)]
    enum Script {
        LoadOk { has_initializer: bool },
        LoadErr,
        LoadFault,
        InitFault,
    }

    struct ScriptedHost {
        scripts: HashMap<PathBuf, Script>,
        load_attempts: AtomicUsize,
        unloads: Arc<AtomicUsize>,
    }

    struct ScriptedModule {
        path: PathBuf,
        script: Script,
        unloads: Arc<AtomicUsize>,
    }

    impl Drop for ScriptedModule {
        fn drop(&mut self) {
            self.unloads.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl LoadedModule for ScriptedModule {
        fn path(&self) -> &Path {
            &self.path
        }

        fn invoke_initializer(&self, _export: &str) -> InitOutcome {
            match self.script {
                Script::LoadOk {
                    has_initializer: false,
                } => InitOutcome::Missing,
                Script::LoadOk {
                    has_initializer: true,
                } => InitOutcome::Ran,
                Script::InitFault => panic!("initializer raised a fault"),
                _ => unreachable!(),
            }
        }
    }

    impl ModuleHost for ScriptedHost {
        fn load(&self, path: &Path) -> Result<Box<dyn LoadedModule>, ModuleError> {
            self.load_attempts.fetch_add(1, Ordering::SeqCst);
            match self.scripts.get(path).copied() {
                Some(Script::LoadErr) => {
                    Err(ModuleError::LoadFailed("scripted failure".to_string()))
                }
                Some(Script::LoadFault) => panic!("loader raised a fault"),
                Some(script) => Ok(Box::new(ScriptedModule {
                    path: path.to_path_buf(),
                    script,
                    unloads: Arc::clone(&self.unloads),
                })),
                None => Err(ModuleError::NotFound(path.display().to_string())),
            }
        }

        fn inspect(&self, _target: ModuleRef<'_>) -> Result<ModuleMetadata, ModuleError> {
            Err(ModuleError::InspectionUnsupported)
        }
    }

    /// Build a marker-discovery fixture: a tempdir with one marker per
    /// scripted candidate, and a pipeline wired to a scripted host.
    fn fixture(scripts: Vec<(&str, Script)>) -> (tempfile::TempDir, PluginPipeline, Arc<AtomicUsize>) {
        let dir = tempfile::tempdir().unwrap();
        let mut table = HashMap::new();
        for (stem, script) in &scripts {
            std::fs::write(dir.path().join(format!("{stem}_preload.txt")), "").unwrap();
            let library = dir
                .path()
                .join(stem)
                .with_extension(std::env::consts::DLL_EXTENSION);
            table.insert(library, *script);
        }

        let unloads = Arc::new(AtomicUsize::new(0));
        let host = Arc::new(ScriptedHost {
            scripts: table,
            load_attempts: AtomicUsize::new(0),
            unloads: Arc::clone(&unloads),
        });
        let pipeline = PluginPipeline::new(
            host,
            dir.path().to_path_buf(),
            DiscoveryRule::Marker {
                suffix: "_preload.txt".to_string(),
            },
            "Initialize".to_string(),
        );
        (dir, pipeline, unloads)
    }

    #[test]
    fn all_candidates_are_attempted_despite_faults() {
        let (_dir, mut pipeline, _unloads) = fixture(vec![
            ("alpha", Script::LoadOk { has_initializer: true }),
            ("bravo", Script::LoadFault),
            ("charlie", Script::LoadErr),
            ("delta", Script::InitFault),
            ("echo", Script::LoadOk { has_initializer: false }),
        ]);

        pipeline.run();

        let records = pipeline.records();
        assert_eq!(records.len(), 5, "every candidate must be accounted for");

        let successes = records.iter().filter(|r| r.status.is_success()).count();
        let failures = records.iter().filter(|r| !r.status.is_success()).count();
        assert_eq!(successes, 2);
        assert_eq!(failures, 3);
        assert_eq!(pipeline.loaded_count(), 2);
        assert!(pipeline.is_finished());
    }

    #[test]
    fn missing_initializer_is_loaded_not_failed() {
        let (_dir, mut pipeline, _unloads) =
            fixture(vec![("quiet", Script::LoadOk { has_initializer: false })]);
        pipeline.run();

        assert_eq!(pipeline.records().len(), 1);
        assert_eq!(pipeline.records()[0].status, PluginStatus::Loaded);
        assert!(pipeline.records()[0].is_retained());
    }

    #[test]
    fn normal_initializer_return_is_initialized() {
        let (_dir, mut pipeline, _unloads) =
            fixture(vec![("eager", Script::LoadOk { has_initializer: true })]);
        pipeline.run();

        assert_eq!(pipeline.records()[0].status, PluginStatus::Initialized);
        assert!(pipeline.records()[0].is_retained());
    }

    #[test]
    fn faulting_initializer_unloads_the_module() {
        let (_dir, mut pipeline, unloads) = fixture(vec![("bomb", Script::InitFault)]);
        pipeline.run();

        let record = &pipeline.records()[0];
        assert_eq!(record.status, PluginStatus::FailedInitialize);
        assert!(!record.is_retained());
        assert_eq!(
            unloads.load(Ordering::SeqCst),
            1,
            "failed module must be unloaded, not abandoned"
        );
    }

    #[test]
    fn faulting_load_does_not_kill_the_process() {
        let (_dir, mut pipeline, _unloads) = fixture(vec![("bomb", Script::LoadFault)]);
        pipeline.run();
        // Reaching this assertion is the property.
        assert_eq!(pipeline.records()[0].status, PluginStatus::FailedLoad);
    }

    #[test]
    fn empty_directory_scans_zero_candidates() {
        let (_dir, mut pipeline, _unloads) = fixture(vec![]);
        pipeline.run();
        assert!(pipeline.records().is_empty());
        assert!(pipeline.is_finished());
    }

    #[test]
    fn unload_all_releases_retained_handles() {
        let (_dir, mut pipeline, unloads) = fixture(vec![
            ("alpha", Script::LoadOk { has_initializer: true }),
            ("bravo", Script::LoadOk { has_initializer: false }),
        ]);
        pipeline.run();
        assert_eq!(unloads.load(Ordering::SeqCst), 0);

        pipeline.unload_all();
        assert_eq!(unloads.load(Ordering::SeqCst), 2);
        // Records and their statuses survive teardown for forensics.
        assert_eq!(pipeline.records().len(), 2);
    }

    #[test]
    fn marker_without_library_is_a_failed_load() {
        // Marker exists but the library file does not; the host reports
        // NotFound and the record says FailedLoad.
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("ghost_preload.txt"), "").unwrap();

        let host = Arc::new(ScriptedHost {
            scripts: HashMap::new(),
            load_attempts: AtomicUsize::new(0),
            unloads: Arc::new(AtomicUsize::new(0)),
        });
        let mut pipeline = PluginPipeline::new(
            host,
            dir.path().to_path_buf(),
            DiscoveryRule::Marker {
                suffix: "_preload.txt".to_string(),
            },
            "Initialize".to_string(),
        );
        pipeline.run();

        assert_eq!(pipeline.records().len(), 1);
        assert_eq!(pipeline.records()[0].status, PluginStatus::FailedLoad);
    }
}
