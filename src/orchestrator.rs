//! Module load orchestration
//!
//! For every device the [`Resolver`] produces candidate driver names, first
//! from the driver database and, only when that has nothing, from the linker
//! hints. Each candidate then passes through the [`LoadPolicy`]: recorded on
//! the device, checked against the exclusion list, offered to the policy
//! hook, checked against the loaded modules and finally loaded.

use driver_db::{DatabaseError, DriverDatabase, Matches};
use driverd_types::DeviceRecord;
use pnp_hints::{HintsResolver, PnpMatches};
use std::collections::BTreeSet;
use std::io::{BufRead, Seek};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::hooks::PolicyHook;
use crate::kmod::KernelModules;

// ============================================================================
// Candidate resolution
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateSource {
    Database,
    Hints,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub name: String,
    pub source: CandidateSource,
}

/// Driver database plus linker hints fallback
pub struct Resolver<R> {
    database: DriverDatabase<R>,
    hints: HintsResolver,
}

impl<R: BufRead + Seek> Resolver<R> {
    pub fn new(database: DriverDatabase<R>, hints: HintsResolver) -> Self {
        Self { database, hints }
    }

    /// Start resolving `device`. The hints are only consulted if the
    /// database yields no name at all.
    pub fn candidates(&mut self, device: &DeviceRecord) -> Result<Candidates<'_, R>, DatabaseError> {
        let matches = self.database.start_resolution(device)?;
        Ok(Candidates {
            matches: Some(matches),
            hints: &self.hints,
            pnp: None,
            vendor: device.vendor,
            device: device.device,
            from_database: false,
        })
    }

    pub fn resolve_all(&mut self, device: &DeviceRecord) -> Result<Vec<Candidate>, DatabaseError> {
        self.candidates(device)?.collect()
    }
}

/// Lazy candidate sequence returned by [`Resolver::candidates`]
pub struct Candidates<'r, R> {
    matches: Option<Matches<'r, R>>,
    hints: &'r HintsResolver,
    pnp: Option<PnpMatches<'r>>,
    vendor: u16,
    device: u16,
    from_database: bool,
}

impl<R: BufRead + Seek> Iterator for Candidates<'_, R> {
    type Item = Result<Candidate, DatabaseError>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(matches) = self.matches.as_mut() {
            match matches.next() {
                Some(Ok(name)) => {
                    self.from_database = true;
                    return Some(Ok(Candidate {
                        name,
                        source: CandidateSource::Database,
                    }));
                }
                Some(Err(e)) => {
                    self.matches = None;
                    return Some(Err(e));
                }
                None => {
                    self.matches = None;
                    if !self.from_database {
                        self.pnp = Some(self.hints.start_resolution(self.vendor, self.device));
                    }
                }
            }
        }

        let name = self.pnp.as_mut()?.next()?;
        Some(Ok(Candidate {
            name,
            source: CandidateSource::Hints,
        }))
    }
}

// ============================================================================
// Load policy
// ============================================================================

/// What happened to one candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    /// Already recorded on the device by an earlier pass
    Duplicate,
    Excluded,
    /// The policy hook declined
    Vetoed,
    AlreadyLoaded,
    Loaded,
    /// Dry run: the load was logged but not requested
    Simulated,
    /// The load was requested and failed
    Failed,
}

pub struct LoadPolicy {
    exclude: BTreeSet<String>,
    hook: Arc<dyn PolicyHook>,
    modules: Arc<dyn KernelModules>,
    dry_run: bool,
}

impl LoadPolicy {
    pub fn new(
        exclude: impl IntoIterator<Item = String>,
        hook: Arc<dyn PolicyHook>,
        modules: Arc<dyn KernelModules>,
        dry_run: bool,
    ) -> Self {
        Self {
            exclude: exclude.into_iter().collect(),
            hook,
            modules,
            dry_run,
        }
    }

    fn is_excluded(&self, name: &str) -> bool {
        self.exclude.contains(name)
    }

    pub fn hook(&self) -> &Arc<dyn PolicyHook> {
        &self.hook
    }

    pub fn dry_run(&self) -> bool {
        self.dry_run
    }

    async fn apply(&self, device: &mut DeviceRecord, name: &str) -> LoadOutcome {
        if !device.add_driver(name) {
            debug!(device = %device, kmod = name, "Driver already handled for device");
            return LoadOutcome::Duplicate;
        }

        if self.is_excluded(name) {
            info!(device = %device, kmod = name, "{} excluded from loading", name);
            return LoadOutcome::Excluded;
        }

        if !self.hook.affirm(device, name).await {
            info!(device = %device, kmod = name, "affirm returned false");
            return LoadOutcome::Vetoed;
        }

        match self.modules.is_loaded(name).await {
            Ok(true) => {
                info!(device = %device, kmod = name, "{} already loaded", name);
                return LoadOutcome::AlreadyLoaded;
            }
            Ok(false) => {}
            Err(e) => warn!(device = %device, kmod = name, error = %e, "Couldn't query loaded modules"),
        }

        info!(device = %device, kmod = name, "Loading {}", name);
        let outcome = if self.dry_run {
            LoadOutcome::Simulated
        } else {
            match self.modules.load(name).await {
                Ok(()) => LoadOutcome::Loaded,
                Err(e) => {
                    warn!(device = %device, kmod = name, error = %e, "Module load failed");
                    LoadOutcome::Failed
                }
            }
        };
        self.hook.on_load_kmod(device, name).await;
        outcome
    }
}

// ============================================================================
// Orchestrator
// ============================================================================

pub struct Orchestrator<R> {
    resolver: Resolver<R>,
    policy: LoadPolicy,
}

impl<R: BufRead + Seek> Orchestrator<R> {
    pub fn new(resolver: Resolver<R>, policy: LoadPolicy) -> Self {
        Self { resolver, policy }
    }

    pub fn policy(&self) -> &LoadPolicy {
        &self.policy
    }

    /// Resolve `device` and act on every candidate. Returns each candidate
    /// with what happened to it, in resolution order.
    pub async fn process(&mut self, device: &mut DeviceRecord) -> Vec<(String, LoadOutcome)> {
        let mut outcomes = Vec::new();

        match self.resolver.candidates(device) {
            Ok(candidates) => {
                for next in candidates {
                    let candidate = match next {
                        Ok(candidate) => candidate,
                        Err(e) => {
                            warn!(device = %device, error = %e, "Driver database scan aborted");
                            break;
                        }
                    };
                    debug!(device = %device, kmod = %candidate.name, source = ?candidate.source, "Candidate");
                    let outcome = self.policy.apply(device, &candidate.name).await;
                    outcomes.push((candidate.name, outcome));
                }
            }
            Err(e) => warn!(device = %device, error = %e, "Driver resolution failed"),
        }

        self.policy.hook.on_finished(device).await;
        if outcomes.is_empty() {
            info!(device = %device, "No driver found");
        }
        outcomes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::{NoopHook, RecordingHook};
    use crate::kmod::InMemoryModules;
    use driverd_types::Interface;
    use pretty_assertions::assert_eq;
    use std::io::Cursor;
    use tempfile::TempDir;

    const DATABASE: &str = "\
# test database
if_em
\t8086
\t\t10d3
\t\t153a
if_bwn bwn_v4_ucode
\t14e4
\t\t4306
umass
\t*
\t\t* ifclass=8
nvidia
\t10de
\t\t1c82
";

    fn resolver(hints: HintsResolver) -> Resolver<Cursor<&'static [u8]>> {
        Resolver::new(
            DriverDatabase::from_reader(Cursor::new(DATABASE.as_bytes())),
            hints,
        )
    }

    fn orchestrator(
        modules: Arc<InMemoryModules>,
        hook: Arc<dyn PolicyHook>,
        exclude: &[&str],
        dry_run: bool,
    ) -> Orchestrator<Cursor<&'static [u8]>> {
        Orchestrator::new(
            resolver(HintsResolver::new(Vec::<std::path::PathBuf>::new())),
            LoadPolicy::new(
                exclude.iter().map(|s| s.to_string()),
                hook,
                modules,
                dry_run,
            ),
        )
    }

    fn push_int(buf: &mut Vec<u8>, v: i32) {
        while buf.len() % 4 != 0 {
            buf.push(0);
        }
        buf.extend_from_slice(&v.to_ne_bytes());
    }

    fn push_str(buf: &mut Vec<u8>, s: &str) {
        buf.push(s.len() as u8);
        buf.extend_from_slice(s.as_bytes());
    }

    fn push_record(buf: &mut Vec<u8>, rectype: i32, payload: impl FnOnce(&mut Vec<u8>)) {
        push_int(buf, 0);
        let start = buf.len() - 4;
        push_int(buf, rectype);
        payload(buf);
        while buf.len() % 4 != 0 {
            buf.push(0);
        }
        let len = (buf.len() - start - 4) as i32;
        buf[start..start + 4].copy_from_slice(&len.to_ne_bytes());
    }

    /// Hints file claiming `vendor:device` for `module`
    fn hints_file(dir: &TempDir, module: &str, vendor: i32, device: i32) -> std::path::PathBuf {
        let mut buf = Vec::new();
        push_int(&mut buf, pnp_hints::LINKER_HINTS_VERSION);
        push_record(&mut buf, pnp_hints::MDT_MODULE, |b| {
            push_str(b, module);
            push_str(b, &format!("{module}.ko"));
        });
        push_record(&mut buf, pnp_hints::MDT_PNP_INFO, |b| {
            push_str(b, "pci");
            push_str(b, "I:vendor;I:device");
            push_int(b, 1);
            push_int(b, vendor);
            push_int(b, device);
        });
        let path = dir.path().join("linker.hints");
        std::fs::write(&path, buf).unwrap();
        path
    }

    #[tokio::test]
    async fn test_loads_every_candidate_in_order() {
        let modules = Arc::new(InMemoryModules::empty());
        let hook = Arc::new(RecordingHook::default());
        let mut orch = orchestrator(modules.clone(), hook.clone(), &[], false);

        let mut dev = DeviceRecord::pci(0x14e4, 0x4306);
        let outcomes = orch.process(&mut dev).await;

        assert_eq!(
            outcomes,
            vec![
                ("if_bwn".to_string(), LoadOutcome::Loaded),
                ("bwn_v4_ucode".to_string(), LoadOutcome::Loaded),
            ]
        );
        assert_eq!(modules.load_calls(), vec!["if_bwn", "bwn_v4_ucode"]);
        assert_eq!(dev.drivers(), &["if_bwn", "bwn_v4_ucode"]);
        assert_eq!(
            hook.calls(),
            vec![
                "affirm if_bwn",
                "on_load_kmod if_bwn",
                "affirm bwn_v4_ucode",
                "on_load_kmod bwn_v4_ucode",
                "on_finished 14e4:4306",
            ]
        );
    }

    #[tokio::test]
    async fn test_excluded_driver_is_recorded_but_not_offered() {
        let modules = Arc::new(InMemoryModules::empty());
        let hook = Arc::new(RecordingHook::default());
        let mut orch = orchestrator(modules.clone(), hook.clone(), &["nvidia"], false);

        let mut dev = DeviceRecord::pci(0x10de, 0x1c82);
        let outcomes = orch.process(&mut dev).await;

        assert_eq!(outcomes, vec![("nvidia".to_string(), LoadOutcome::Excluded)]);
        assert!(dev.has_driver("nvidia"));
        assert!(modules.load_calls().is_empty());
        assert_eq!(hook.calls(), vec!["on_finished 10de:1c82"]);
    }

    #[tokio::test]
    async fn test_hook_veto_skips_load() {
        let modules = Arc::new(InMemoryModules::empty());
        let hook = Arc::new(RecordingHook::vetoing("if_bwn"));
        let mut orch = orchestrator(modules.clone(), hook.clone(), &[], false);

        let mut dev = DeviceRecord::pci(0x14e4, 0x4306);
        let outcomes = orch.process(&mut dev).await;

        assert_eq!(
            outcomes,
            vec![
                ("if_bwn".to_string(), LoadOutcome::Vetoed),
                ("bwn_v4_ucode".to_string(), LoadOutcome::Loaded),
            ]
        );
        assert_eq!(modules.load_calls(), vec!["bwn_v4_ucode"]);
    }

    #[tokio::test]
    async fn test_already_loaded_module_is_not_reloaded() {
        let modules = Arc::new(InMemoryModules::new(["kernel", "pci/em"]));
        let hook = Arc::new(RecordingHook::default());
        let mut orch = orchestrator(modules.clone(), hook.clone(), &[], false);

        let mut dev = DeviceRecord::pci(0x8086, 0x153a);
        let outcomes = orch.process(&mut dev).await;

        assert_eq!(outcomes, vec![("if_em".to_string(), LoadOutcome::AlreadyLoaded)]);
        assert!(modules.load_calls().is_empty());
        assert_eq!(hook.calls(), vec!["affirm if_em", "on_finished 8086:153a"]);
    }

    #[tokio::test]
    async fn test_dry_run_never_loads() {
        let modules = Arc::new(InMemoryModules::empty());
        let hook = Arc::new(RecordingHook::default());
        let mut orch = orchestrator(modules.clone(), hook.clone(), &[], true);

        let mut dev = DeviceRecord::pci(0x8086, 0x10d3);
        let outcomes = orch.process(&mut dev).await;

        assert_eq!(outcomes, vec![("if_em".to_string(), LoadOutcome::Simulated)]);
        assert!(modules.load_calls().is_empty());
        assert!(hook.calls().contains(&"on_load_kmod if_em".to_string()));
    }

    #[tokio::test]
    async fn test_load_failure_does_not_stop_processing() {
        let modules = Arc::new(InMemoryModules::empty().with_broken("if_bwn"));
        let mut orch = orchestrator(modules.clone(), Arc::new(NoopHook), &[], false);

        let mut dev = DeviceRecord::pci(0x14e4, 0x4306);
        let outcomes = orch.process(&mut dev).await;

        assert_eq!(
            outcomes,
            vec![
                ("if_bwn".to_string(), LoadOutcome::Failed),
                ("bwn_v4_ucode".to_string(), LoadOutcome::Loaded),
            ]
        );
    }

    #[tokio::test]
    async fn test_processing_twice_is_idempotent() {
        let modules = Arc::new(InMemoryModules::empty());
        let hook = Arc::new(RecordingHook::default());
        let mut orch = orchestrator(modules.clone(), hook.clone(), &[], false);

        let mut dev = DeviceRecord::usb(0x0781, 0x5567).with_interface(Interface::new(8, 6, 0x50));
        orch.process(&mut dev).await;
        let second = orch.process(&mut dev).await;

        assert_eq!(second, vec![("umass".to_string(), LoadOutcome::Duplicate)]);
        assert_eq!(dev.drivers(), &["umass"]);
        assert_eq!(modules.load_calls(), vec!["umass"]);
        let load_hooks = hook
            .calls()
            .iter()
            .filter(|c| c.starts_with("on_load_kmod"))
            .count();
        assert_eq!(load_hooks, 1);
    }

    #[tokio::test]
    async fn test_no_driver_found_still_finishes() {
        let hook = Arc::new(RecordingHook::default());
        let mut orch = orchestrator(Arc::new(InMemoryModules::empty()), hook.clone(), &[], false);

        let mut dev = DeviceRecord::pci(0xdead, 0xbeef);
        assert!(orch.process(&mut dev).await.is_empty());
        assert_eq!(hook.calls(), vec!["on_finished dead:beef"]);
    }

    #[test]
    fn test_hints_used_only_when_database_has_nothing() {
        let dir = TempDir::new().unwrap();
        let path = hints_file(&dir, "if_iwm", 0x8086, 0x24fd);
        let mut r = resolver(HintsResolver::new([path]));

        let iwm = DeviceRecord::pci(0x8086, 0x24fd);
        assert_eq!(
            r.resolve_all(&iwm).unwrap(),
            vec![Candidate {
                name: "if_iwm".to_string(),
                source: CandidateSource::Hints,
            }]
        );

        // Database hit: the hints are not consulted
        let path = hints_file(&dir, "em_alt", 0x8086, 0x10d3);
        let mut r = resolver(HintsResolver::new([path]));
        let em = DeviceRecord::pci(0x8086, 0x10d3);
        assert_eq!(
            r.resolve_all(&em).unwrap(),
            vec![Candidate {
                name: "if_em".to_string(),
                source: CandidateSource::Database,
            }]
        );
    }

    #[tokio::test]
    async fn test_hints_candidate_is_loaded() {
        let dir = TempDir::new().unwrap();
        let path = hints_file(&dir, "if_iwm", 0x8086, 0x24fd);
        let modules = Arc::new(InMemoryModules::empty());
        let mut orch = Orchestrator::new(
            resolver(HintsResolver::new([path])),
            LoadPolicy::new(Vec::new(), Arc::new(NoopHook), modules.clone(), false),
        );

        let mut dev = DeviceRecord::pci(0x8086, 0x24fd);
        orch.process(&mut dev).await;
        assert_eq!(modules.load_calls(), vec!["if_iwm"]);
    }
}
