use crate::config::Settings;
use crate::file_info::{FileInfo, FileKind, FileStatus};
use crate::parser::PddlParser;
use crate::scheduler::Debouncer;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tower_lsp::lsp_types::Url;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkspaceEvent {
    /// A file seen for the first time. Always followed by `Updated` once
    /// it is parsed.
    Inserted(Url),
    /// A file (re-)parsed.
    Updated(Url),
    /// Sent just before a file leaves the workspace.
    Removing(Url),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    /// Newer version accepted; the file is Dirty until re-parsed.
    Updated,
    /// Same or older version; nothing changed.
    Unchanged,
}

/// Result of matching a problem or plan with domain files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Binding {
    Unique(Url),
    Missing,
    Ambiguous(Vec<Url>),
}

impl Binding {
    fn from_candidates(mut candidates: Vec<Url>) -> Self {
        match candidates.len() {
            0 => Binding::Missing,
            1 => Binding::Unique(candidates.remove(0)),
            _ => Binding::Ambiguous(candidates),
        }
    }

    pub fn unique(&self) -> Option<&Url> {
        match self {
            Binding::Unique(uri) => Some(uri),
            _ => None,
        }
    }
}

/// Files sharing a directory. Bindings never cross folder boundaries.
#[derive(Debug, Default)]
pub struct Folder {
    files: BTreeMap<Url, FileInfo>,
}

impl Folder {
    pub fn files(&self) -> impl Iterator<Item = &FileInfo> {
        self.files.values()
    }
}

/// All known files, grouped by folder.
#[derive(Debug, Default)]
pub struct Workspace {
    parser: PddlParser,
    folders: BTreeMap<Url, Folder>,
    subscribers: Vec<mpsc::UnboundedSender<WorkspaceEvent>>,
}

impl Workspace {
    pub fn new(parser: PddlParser) -> Self {
        Self {
            parser,
            folders: BTreeMap::new(),
            subscribers: Vec::new(),
        }
    }

    pub fn set_parser(&mut self, parser: PddlParser) {
        self.parser = parser;
    }

    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<WorkspaceEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.push(tx);
        rx
    }

    fn emit(&mut self, event: WorkspaceEvent) {
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn folder_of(uri: &Url) -> Url {
        uri.join(".").unwrap_or_else(|_| uri.clone())
    }

    pub fn folders(&self) -> impl Iterator<Item = (&Url, &Folder)> {
        self.folders.iter()
    }

    pub fn files(&self) -> impl Iterator<Item = &FileInfo> {
        self.folders.values().flat_map(Folder::files)
    }

    pub fn get_file_info(&self, uri: &Url) -> Option<&FileInfo> {
        self.folders
            .get(&Self::folder_of(uri))
            .and_then(|folder| folder.files.get(uri))
    }

    fn get_file_info_mut(&mut self, uri: &Url) -> Option<&mut FileInfo> {
        self.folders
            .get_mut(&Self::folder_of(uri))
            .and_then(|folder| folder.files.get_mut(uri))
    }

    pub fn contains(&self, uri: &Url) -> bool {
        self.get_file_info(uri).is_some()
    }

    pub fn parser(&self) -> &PddlParser {
        &self.parser
    }

    /// Records new content. Existing files only change when `version` is
    /// newer and are left Dirty; new files are parsed right away.
    pub fn upsert_file(&mut self, uri: &Url, version: i32, text: &str) -> UpsertOutcome {
        if let Some(info) = self.get_file_info_mut(uri) {
            return if info.update(version, text) {
                UpsertOutcome::Updated
            } else {
                UpsertOutcome::Unchanged
            };
        }
        let parsed = self.parser.parse(uri, version, text);
        self.install_parsed(parsed)
    }

    /// Upserts and parses right away if anything changed.
    pub fn upsert_and_parse_file(&mut self, uri: &Url, version: i32, text: &str) -> UpsertOutcome {
        let outcome = self.upsert_file(uri, version, text);
        if outcome == UpsertOutcome::Updated {
            self.parse_file(uri);
            self.emit(WorkspaceEvent::Updated(uri.clone()));
        }
        outcome
    }

    /// Replaces the file with a fresh parse of its current text.
    pub fn parse_file(&mut self, uri: &Url) -> bool {
        let Some(current) = self.get_file_info(uri) else {
            return false;
        };
        let parsed = self.parser.parse(uri, current.version, current.text());
        if let Some(slot) = self.get_file_info_mut(uri) {
            *slot = parsed;
        }
        true
    }

    /// Stores a parse produced elsewhere. It replaces the current entry only
    /// when it is newer, or is the parse of the current Dirty text.
    pub fn install_parsed(&mut self, parsed: FileInfo) -> UpsertOutcome {
        let uri = parsed.uri.clone();
        let outcome = match self.get_file_info_mut(&uri) {
            Some(current) => {
                let fresh = parsed.version > current.version
                    || (parsed.version == current.version
                        && current.status == FileStatus::Dirty
                        && current.text() == parsed.text());
                if !fresh {
                    return UpsertOutcome::Unchanged;
                }
                *current = parsed;
                UpsertOutcome::Updated
            }
            None => {
                self.folders
                    .entry(Self::folder_of(&uri))
                    .or_default()
                    .files
                    .insert(uri.clone(), parsed);
                UpsertOutcome::Inserted
            }
        };
        if outcome == UpsertOutcome::Inserted {
            self.emit(WorkspaceEvent::Inserted(uri.clone()));
        }
        self.emit(WorkspaceEvent::Updated(uri));
        outcome
    }

    /// What needs parsing: URI, version and text of every Dirty file.
    pub fn dirty_files(&self) -> Vec<(Url, i32, String)> {
        self.files()
            .filter(|info| info.status == FileStatus::Dirty)
            .map(|info| (info.uri.clone(), info.version, info.text().to_string()))
            .collect()
    }

    /// Parses every Dirty file and returns their URIs.
    pub fn reparse_dirty(&mut self) -> Vec<Url> {
        let parsed: Vec<FileInfo> = self
            .dirty_files()
            .into_iter()
            .map(|(uri, version, text)| self.parser.parse(&uri, version, &text))
            .collect();
        let updated: Vec<Url> = parsed
            .into_iter()
            .filter_map(|info| {
                let uri = info.uri.clone();
                (self.install_parsed(info) != UpsertOutcome::Unchanged).then_some(uri)
            })
            .collect();
        if !updated.is_empty() {
            tracing::debug!("Re-parsed {} dirty file(s)", updated.len());
        }
        updated
    }

    pub fn remove_file(&mut self, uri: &Url) -> bool {
        if !self.contains(uri) {
            return false;
        }
        self.emit(WorkspaceEvent::Removing(uri.clone()));
        let folder_uri = Self::folder_of(uri);
        if let Some(folder) = self.folders.get_mut(&folder_uri) {
            folder.files.remove(uri);
            if folder.files.is_empty() {
                self.folders.remove(&folder_uri);
            }
        }
        true
    }

    pub fn set_status(&mut self, uri: &Url, status: FileStatus) {
        if let Some(info) = self.get_file_info_mut(uri) {
            info.status = status;
        }
    }

    fn siblings<'a>(&'a self, uri: &Url) -> impl Iterator<Item = &'a FileInfo> + 'a {
        self.folders
            .get(&Self::folder_of(uri))
            .into_iter()
            .flat_map(Folder::files)
    }

    fn domains_named<'a>(&'a self, uri: &Url, name: &'a str) -> Vec<Url> {
        self.siblings(uri)
            .filter(|info| {
                info.as_domain()
                    .map(|domain| domain.is_name(name))
                    .unwrap_or(false)
            })
            .map(|info| info.uri.clone())
            .collect()
    }

    /// Domain files in the same folder whose name matches what the problem
    /// (or plan) declares. Plans without a `;;!domain:` line match any domain.
    pub fn domain_binding(&self, uri: &Url) -> Binding {
        let Some(info) = self.get_file_info(uri) else {
            return Binding::Missing;
        };
        match &info.kind {
            FileKind::Domain(_) => Binding::Unique(uri.clone()),
            FileKind::Problem(problem) => {
                Binding::from_candidates(self.domains_named(uri, &problem.domain_name))
            }
            FileKind::Plan(plan) => match &plan.domain_name {
                Some(name) => Binding::from_candidates(self.domains_named(uri, name)),
                None => Binding::from_candidates(
                    self.siblings(uri)
                        .filter(|info| info.is_domain())
                        .map(|info| info.uri.clone())
                        .collect(),
                ),
            },
            FileKind::Happenings(_) | FileKind::Unknown => Binding::Missing,
        }
    }

    /// The domain a file belongs to, or `None` when missing or ambiguous.
    pub fn get_domain_file_for(&self, uri: &Url) -> Option<&FileInfo> {
        self.domain_binding(uri)
            .unique()
            .and_then(|domain| self.get_file_info(domain))
    }

    /// Problem files in the domain's folder that declare its name.
    pub fn get_problem_files(&self, domain_uri: &Url) -> Vec<&FileInfo> {
        let Some(domain) = self.get_file_info(domain_uri).and_then(FileInfo::as_domain) else {
            return Vec::new();
        };
        self.siblings(domain_uri)
            .filter(|info| {
                info.as_problem()
                    .map(|problem| problem.is_for_domain(&domain.name))
                    .unwrap_or(false)
            })
            .collect()
    }

    /// Plans in the domain's folder that bind to it.
    pub fn get_plan_files(&self, domain_uri: &Url) -> Vec<&FileInfo> {
        self.siblings(domain_uri)
            .filter(|info| matches!(info.kind, FileKind::Plan(_)))
            .filter(|info| self.domain_binding(&info.uri).unique() == Some(domain_uri))
            .collect()
    }

    /// The problem a plan was produced for.
    pub fn problem_binding(&self, plan_uri: &Url) -> Binding {
        let Some(FileKind::Plan(plan)) = self.get_file_info(plan_uri).map(|info| &info.kind) else {
            return Binding::Missing;
        };
        let domain = self.domain_binding(plan_uri);
        let candidates = self
            .siblings(plan_uri)
            .filter(|info| {
                let Some(problem) = info.as_problem() else {
                    return false;
                };
                let name_matches = plan
                    .problem_name
                    .as_deref()
                    .map(|name| problem.name.eq_ignore_ascii_case(name))
                    .unwrap_or(true);
                name_matches && self.domain_binding(&info.uri) == domain
            })
            .map(|info| info.uri.clone())
            .collect();
        Binding::from_candidates(candidates)
    }
}

/// The workspace behind a lock, plus the debounced re-parse timer.
#[derive(Debug, Clone)]
pub struct SharedWorkspace {
    inner: Arc<RwLock<Workspace>>,
    debouncer: Debouncer,
}

impl SharedWorkspace {
    pub fn new(settings: &Settings) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Workspace::new(PddlParser::new(settings)))),
            debouncer: Debouncer::new(Duration::from_millis(settings.parser_debounce_ms)),
        }
    }

    pub fn apply_settings(&self, settings: &Settings) {
        self.inner.write().set_parser(PddlParser::new(settings));
        self.debouncer
            .set_delay(Duration::from_millis(settings.parser_debounce_ms));
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Workspace> {
        self.inner.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, Workspace> {
        self.inner.write()
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<WorkspaceEvent> {
        self.inner.write().subscribe()
    }

    /// Parses on a blocking thread and stores the result. The lock is only
    /// taken to check the version and to install the parse.
    pub async fn upsert_and_parse(&self, uri: &Url, version: i32, text: &str) -> UpsertOutcome {
        let parser = {
            let workspace = self.inner.read();
            if let Some(current) = workspace.get_file_info(uri) {
                if version <= current.version {
                    return UpsertOutcome::Unchanged;
                }
            }
            workspace.parser().clone()
        };
        let (owned_uri, owned_text) = (uri.clone(), text.to_string());
        let parsed = tokio::task::spawn_blocking(move || {
            parser.parse(&owned_uri, version, &owned_text)
        })
        .await;
        match parsed {
            Ok(parsed) => self.inner.write().install_parsed(parsed),
            Err(err) => {
                tracing::error!("Parse task for {} failed: {}", uri, err);
                UpsertOutcome::Unchanged
            }
        }
    }

    /// Records an edit and schedules a re-parse of all Dirty files once
    /// edits stop arriving for the debounce delay. Unknown files are parsed
    /// straight away.
    pub async fn upsert_debounced(&self, uri: &Url, version: i32, text: &str) -> UpsertOutcome {
        let known = self.inner.read().contains(uri);
        if !known {
            return self.upsert_and_parse(uri, version, text).await;
        }
        let outcome = self.inner.write().upsert_file(uri, version, text);
        if outcome == UpsertOutcome::Updated {
            self.schedule_reparse();
        }
        outcome
    }

    pub fn schedule_reparse(&self) {
        let inner = Arc::clone(&self.inner);
        self.debouncer.schedule(move || async move {
            reparse_off_lock(inner).await;
        });
    }

    /// Parses now, dropping any pending debounced re-parse.
    pub async fn parse_now(&self) -> Vec<Url> {
        self.debouncer.cancel();
        reparse_off_lock(Arc::clone(&self.inner)).await
    }
}

/// Snapshots the Dirty files, parses them on a blocking thread with no lock
/// held and installs whatever is still current.
async fn reparse_off_lock(inner: Arc<RwLock<Workspace>>) -> Vec<Url> {
    let (parser, dirty) = {
        let workspace = inner.read();
        (workspace.parser().clone(), workspace.dirty_files())
    };
    if dirty.is_empty() {
        return Vec::new();
    }
    let parsed = tokio::task::spawn_blocking(move || {
        dirty
            .into_iter()
            .map(|(uri, version, text)| parser.parse(&uri, version, &text))
            .collect::<Vec<_>>()
    })
    .await;
    let parsed = match parsed {
        Ok(parsed) => parsed,
        Err(err) => {
            tracing::error!("Re-parse task failed: {}", err);
            return Vec::new();
        }
    };
    let mut workspace = inner.write();
    let updated: Vec<Url> = parsed
        .into_iter()
        .filter_map(|info| {
            let uri = info.uri.clone();
            (workspace.install_parsed(info) != UpsertOutcome::Unchanged).then_some(uri)
        })
        .collect();
    if !updated.is_empty() {
        tracing::debug!("Re-parsed {} dirty file(s)", updated.len());
    }
    updated
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOMAIN: &str = "(define (domain logistics) (:predicates (at ?x ?y)))";
    const PROBLEM: &str = "(define (problem p1) (:domain LOGISTICS) (:init (at a b)))";

    fn uri(path: &str) -> Url {
        Url::parse(&format!("file:///w/{}", path)).unwrap()
    }

    #[test]
    fn same_version_is_not_reparsed() {
        let mut workspace = Workspace::default();
        let domain = uri("domain.pddl");
        assert_eq!(
            workspace.upsert_and_parse_file(&domain, 1, DOMAIN),
            UpsertOutcome::Inserted
        );
        assert_eq!(
            workspace.upsert_and_parse_file(&domain, 1, "(define (domain other))"),
            UpsertOutcome::Unchanged
        );
        let info = workspace.get_file_info(&domain).unwrap();
        assert_eq!(info.as_domain().unwrap().name, "logistics");
        assert_eq!(info.status, FileStatus::Parsed);
    }

    #[test]
    fn binds_problem_to_domain_case_insensitively() {
        let mut workspace = Workspace::default();
        workspace.upsert_and_parse_file(&uri("domain.pddl"), 1, DOMAIN);
        workspace.upsert_and_parse_file(&uri("p1.pddl"), 1, PROBLEM);
        assert_eq!(
            workspace.domain_binding(&uri("p1.pddl")),
            Binding::Unique(uri("domain.pddl"))
        );
        let problems = workspace.get_problem_files(&uri("domain.pddl"));
        assert_eq!(problems.len(), 1);
        assert_eq!(problems[0].uri, uri("p1.pddl"));
    }

    #[test]
    fn ambiguous_or_missing_domains_do_not_bind() {
        let mut workspace = Workspace::default();
        workspace.upsert_and_parse_file(&uri("p1.pddl"), 1, PROBLEM);
        assert_eq!(workspace.domain_binding(&uri("p1.pddl")), Binding::Missing);

        workspace.upsert_and_parse_file(&uri("domain.pddl"), 1, DOMAIN);
        workspace.upsert_and_parse_file(&uri("domain2.pddl"), 1, DOMAIN);
        assert!(matches!(
            workspace.domain_binding(&uri("p1.pddl")),
            Binding::Ambiguous(candidates) if candidates.len() == 2
        ));
        assert!(workspace.get_domain_file_for(&uri("p1.pddl")).is_none());
    }

    #[test]
    fn folders_isolate_bindings() {
        let mut workspace = Workspace::default();
        workspace.upsert_and_parse_file(&uri("a/domain.pddl"), 1, DOMAIN);
        workspace.upsert_and_parse_file(&uri("b/p1.pddl"), 1, PROBLEM);
        assert_eq!(workspace.domain_binding(&uri("b/p1.pddl")), Binding::Missing);
        assert_eq!(workspace.folders().count(), 2);
    }

    #[test]
    fn binds_plans_through_meta_comments() {
        let mut workspace = Workspace::default();
        workspace.upsert_and_parse_file(&uri("domain.pddl"), 1, DOMAIN);
        workspace.upsert_and_parse_file(&uri("p1.pddl"), 1, PROBLEM);
        workspace.upsert_and_parse_file(
            &uri("p1.plan"),
            1,
            ";;!domain: logistics\n;;!problem: p1\n0: (drive t a b) [1]",
        );
        assert_eq!(
            workspace.domain_binding(&uri("p1.plan")),
            Binding::Unique(uri("domain.pddl"))
        );
        assert_eq!(
            workspace.problem_binding(&uri("p1.plan")),
            Binding::Unique(uri("p1.pddl"))
        );
        assert_eq!(workspace.get_plan_files(&uri("domain.pddl")).len(), 1);
    }

    #[test]
    fn emits_events_in_order() {
        let mut workspace = Workspace::default();
        let mut events = workspace.subscribe();
        let domain = uri("domain.pddl");
        workspace.upsert_and_parse_file(&domain, 1, DOMAIN);
        workspace.upsert_and_parse_file(&domain, 2, DOMAIN);
        assert!(workspace.remove_file(&domain));
        assert!(!workspace.remove_file(&domain));

        assert_eq!(events.try_recv().unwrap(), WorkspaceEvent::Inserted(domain.clone()));
        assert_eq!(events.try_recv().unwrap(), WorkspaceEvent::Updated(domain.clone()));
        assert_eq!(events.try_recv().unwrap(), WorkspaceEvent::Updated(domain.clone()));
        assert_eq!(events.try_recv().unwrap(), WorkspaceEvent::Removing(domain.clone()));
        assert!(events.try_recv().is_err());
        assert_eq!(workspace.folders().count(), 0);
    }

    #[test]
    fn new_files_are_parsed_on_first_upsert() {
        let mut workspace = Workspace::default();
        let mut events = workspace.subscribe();
        let domain = uri("domain.pddl");
        assert_eq!(workspace.upsert_file(&domain, 1, DOMAIN), UpsertOutcome::Inserted);

        let info = workspace.get_file_info(&domain).unwrap();
        assert_eq!(info.status, FileStatus::Parsed);
        assert_eq!(info.as_domain().unwrap().name, "logistics");
        assert_eq!(info.syntax_tree.text(), info.text());
        assert_eq!(events.try_recv().unwrap(), WorkspaceEvent::Inserted(domain.clone()));
        assert_eq!(events.try_recv().unwrap(), WorkspaceEvent::Updated(domain.clone()));
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn stale_parses_are_not_installed() {
        let mut workspace = Workspace::default();
        let domain = uri("domain.pddl");
        workspace.upsert_and_parse_file(&domain, 1, DOMAIN);
        workspace.upsert_file(&domain, 3, "(define (domain newer))");

        let stale = workspace.parser().parse(&domain, 2, "(define (domain older))");
        assert_eq!(workspace.install_parsed(stale), UpsertOutcome::Unchanged);
        assert_eq!(
            workspace.get_file_info(&domain).unwrap().status,
            FileStatus::Dirty
        );

        let current = workspace.parser().parse(&domain, 3, "(define (domain newer))");
        assert_eq!(workspace.install_parsed(current), UpsertOutcome::Updated);
        let info = workspace.get_file_info(&domain).unwrap();
        assert_eq!(info.as_domain().unwrap().name, "newer");
        assert!(workspace.dirty_files().is_empty());
    }

    #[tokio::test]
    async fn parses_off_the_lock_and_ignores_older_versions() {
        let shared = SharedWorkspace::new(&Settings::default());
        let mut events = shared.subscribe();
        let domain = uri("domain.pddl");
        assert_eq!(
            shared.upsert_and_parse(&domain, 4, DOMAIN).await,
            UpsertOutcome::Inserted
        );
        assert_eq!(
            shared
                .upsert_and_parse(&domain, 3, "(define (domain older))")
                .await,
            UpsertOutcome::Unchanged
        );
        assert_eq!(
            shared
                .upsert_and_parse(&domain, 5, "(define (domain renamed))")
                .await,
            UpsertOutcome::Updated
        );

        let workspace = shared.read();
        let info = workspace.get_file_info(&domain).unwrap();
        assert_eq!(info.version, 5);
        assert_eq!(info.as_domain().unwrap().name, "renamed");
        assert_eq!(events.try_recv().unwrap(), WorkspaceEvent::Inserted(domain.clone()));
        assert_eq!(events.try_recv().unwrap(), WorkspaceEvent::Updated(domain.clone()));
        assert_eq!(events.try_recv().unwrap(), WorkspaceEvent::Updated(domain.clone()));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn newer_version_is_dirty_until_debounced_parse() {
        let settings = Settings {
            parser_debounce_ms: 20,
            ..Settings::default()
        };
        let shared = SharedWorkspace::new(&settings);
        let domain = uri("domain.pddl");
        shared.upsert_debounced(&domain, 1, DOMAIN).await;
        assert_eq!(
            shared.read().get_file_info(&domain).unwrap().status,
            FileStatus::Parsed
        );

        let outcome = shared
            .upsert_debounced(&domain, 2, "(define (domain renamed))")
            .await;
        assert_eq!(outcome, UpsertOutcome::Updated);
        assert_eq!(
            shared.read().get_file_info(&domain).unwrap().status,
            FileStatus::Dirty
        );

        tokio::time::sleep(Duration::from_millis(200)).await;
        let workspace = shared.read();
        let info = workspace.get_file_info(&domain).unwrap();
        assert_eq!(info.status, FileStatus::Parsed);
        assert_eq!(info.version, 2);
        assert_eq!(info.as_domain().unwrap().name, "renamed");
    }

    #[tokio::test]
    async fn parse_now_skips_the_delay() {
        let shared = SharedWorkspace::new(&Settings::default());
        let domain = uri("domain.pddl");
        shared.upsert_debounced(&domain, 1, DOMAIN).await;
        shared
            .upsert_debounced(&domain, 2, "(define (domain renamed))")
            .await;
        assert_eq!(shared.parse_now().await, vec![domain.clone()]);
        assert_eq!(
            shared.read().get_file_info(&domain).unwrap().status,
            FileStatus::Parsed
        );
    }
}
