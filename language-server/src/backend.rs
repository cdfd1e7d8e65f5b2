use crate::analysis::{collect_diagnostics, scan_directory};
use crate::completion::{completions, TRIGGER_CHARACTERS};
use crate::config::{Settings, SERVER_NAME};
use crate::error::{PlanningError, ValidationError};
use crate::formatter;
use crate::planner::{planner_from_settings, Planner, PlanningRequest};
use crate::symbols::{self, document_symbols, find_symbol_references, get_symbol_info, is_valid_name};
use crate::validation::{DiagnosticsSink, ValidationReport, ValidationScheduler};
use crate::workspace::{SharedWorkspace, Workspace, WorkspaceEvent};
use dashmap::{DashMap, DashSet};
use parking_lot::RwLock;
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;
use tower_lsp::jsonrpc::{Error, Result};
use tower_lsp::lsp_types::*;
use tower_lsp::{Client, LanguageServer};

pub const PLAN_COMMAND: &str = "pddl.planAndDisplayResult";
pub const STOP_PLANNER_COMMAND: &str = "pddl.stopPlanner";
pub const VALIDATE_COMMAND: &str = "pddl.validate";

/// Version given to files read from disk rather than opened in the editor.
const DISK_VERSION: i32 = -1;

/// Publishes parse and validator diagnostics together.
#[derive(Clone)]
pub(crate) struct Publisher {
    client: Client,
    workspace: SharedWorkspace,
    settings: Arc<RwLock<Settings>>,
    validator_diagnostics: Arc<DashMap<Url, Vec<Diagnostic>>>,
    open_documents: Arc<DashSet<Url>>,
}

impl Publisher {
    async fn publish_file(&self, uri: &Url) {
        let prepared = {
            let workspace = self.workspace.read();
            workspace.get_file_info(uri).map(|file| {
                let max_problems = self.settings.read().max_number_of_problems;
                let mut diagnostics = collect_diagnostics(&workspace, uri, max_problems);
                if let Some(extra) = self.validator_diagnostics.get(uri) {
                    diagnostics.extend(extra.iter().cloned());
                }
                diagnostics.truncate(max_problems);
                (diagnostics, file.version)
            })
        };
        if let Some((diagnostics, version)) = prepared {
            let version = self.open_documents.contains(uri).then_some(version);
            self.client
                .publish_diagnostics(uri.clone(), diagnostics, version)
                .await;
        }
    }

    async fn clear(&self, uri: &Url) {
        self.validator_diagnostics.remove(uri);
        self.client
            .publish_diagnostics(uri.clone(), Vec::new(), None)
            .await;
    }
}

#[tower_lsp::async_trait]
impl DiagnosticsSink for Publisher {
    async fn publish(&self, report: ValidationReport) {
        for (uri, diagnostics) in report {
            self.validator_diagnostics.insert(uri.clone(), diagnostics);
            self.publish_file(&uri).await;
        }
    }

    async fn report_failure(&self, domain: &Url, error: ValidationError) {
        self.client
            .show_message(
                MessageType::ERROR,
                format!("Validation of {} failed: {}", domain, error),
            )
            .await;
    }
}

/// Files whose diagnostics may change when `uri` changes: everything in
/// its folder, since bindings are resolved per folder.
fn folder_files(workspace: &Workspace, uri: &Url) -> Vec<Url> {
    let folder = Workspace::folder_of(uri);
    workspace
        .folders()
        .filter(|(folder_uri, _)| **folder_uri == folder)
        .flat_map(|(_, folder)| folder.files().map(|file| file.uri.clone()))
        .collect()
}

async fn watch_workspace(
    mut events: mpsc::UnboundedReceiver<WorkspaceEvent>,
    publisher: Publisher,
    validation: ValidationScheduler,
) {
    while let Some(event) = events.recv().await {
        match event {
            WorkspaceEvent::Inserted(uri) => tracing::debug!("Tracking {}", uri),
            WorkspaceEvent::Updated(uri) => {
                publisher.validator_diagnostics.remove(&uri);
                let affected = {
                    let workspace = publisher.workspace.read();
                    folder_files(&workspace, &uri)
                };
                for file in &affected {
                    publisher.publish_file(file).await;
                }
                validation.schedule(&uri);
            }
            WorkspaceEvent::Removing(uri) => publisher.clear(&uri).await,
        }
    }
    tracing::debug!("Workspace event stream closed");
}

fn uri_argument(arguments: &[Value], index: usize) -> Option<Url> {
    arguments
        .get(index)
        .and_then(Value::as_str)
        .and_then(|value| Url::parse(value).ok())
}

pub struct Backend {
    pub(crate) client: Client,
    pub(crate) workspace: SharedWorkspace,
    pub(crate) settings: Arc<RwLock<Settings>>,
    pub(crate) validation: ValidationScheduler,
    pub(crate) planners: Arc<DashMap<Url, Arc<dyn Planner>>>,
    /// Files the editor owns; disk changes never override them.
    pub(crate) open_documents: Arc<DashSet<Url>>,
}

impl Backend {
    pub fn new(client: Client) -> Self {
        let settings = Settings::default();
        let workspace = SharedWorkspace::new(&settings);
        let settings = Arc::new(RwLock::new(settings));
        let open_documents = Arc::new(DashSet::new());
        let publisher = Publisher {
            client: client.clone(),
            workspace: workspace.clone(),
            settings: Arc::clone(&settings),
            validator_diagnostics: Arc::new(DashMap::new()),
            open_documents: Arc::clone(&open_documents),
        };
        let validation = ValidationScheduler::new(
            workspace.clone(),
            Arc::new(publisher.clone()),
            &settings.read(),
        );

        let events = workspace.subscribe();
        tokio::spawn(watch_workspace(events, publisher.clone(), validation.clone()));

        Self {
            client,
            workspace,
            settings,
            validation,
            planners: Arc::new(DashMap::new()),
            open_documents,
        }
    }

    fn apply_settings(&self, settings: Settings) {
        tracing::info!(
            "Applying settings: parser debounce {}ms, validation debounce {}ms",
            settings.parser_debounce_ms,
            settings.validation_debounce_ms
        );
        self.workspace.apply_settings(&settings);
        self.validation.apply_settings(&settings);
        *self.settings.write() = settings;
    }

    /// Loads the other PDDL files next to `uri` so bindings resolve before
    /// they are opened.
    async fn load_folder(&self, uri: &Url) {
        let Some(dir) = uri.to_file_path().ok().and_then(|path| path.parent().map(Path::to_path_buf)) else {
            return;
        };
        for path in scan_directory(&dir) {
            let Ok(file_uri) = Url::from_file_path(&path) else {
                continue;
            };
            let known = self.workspace.read().contains(&file_uri);
            if known {
                continue;
            }
            match std::fs::read_to_string(&path) {
                Ok(text) => {
                    self.workspace
                        .upsert_and_parse(&file_uri, DISK_VERSION, &text)
                        .await;
                }
                Err(err) => tracing::warn!("Could not read {}: {}", path.display(), err),
            }
        }
    }

    async fn reload_from_disk(&self, uri: &Url) {
        if self.open_documents.contains(uri) {
            tracing::debug!("Ignoring disk change to open document {}", uri);
            return;
        }
        let Ok(path) = uri.to_file_path() else {
            return;
        };
        let Ok(text) = std::fs::read_to_string(&path) else {
            return;
        };
        let version = self
            .workspace
            .read()
            .get_file_info(uri)
            .map(|file| file.version.saturating_add(1))
            .unwrap_or(DISK_VERSION);
        self.workspace.upsert_and_parse(uri, version, &text).await;
    }

    fn planning_request(&self, arguments: &[Value]) -> Option<(PlanningRequest, String, String, Url)> {
        let workspace = self.workspace.read();
        let (domain_uri, problem_uri) = match (uri_argument(arguments, 0), uri_argument(arguments, 1)) {
            (Some(domain), Some(problem)) => (domain, problem),
            (Some(problem), None) => (workspace.get_domain_file_for(&problem)?.uri.clone(), problem),
            _ => return None,
        };
        let domain_file = workspace.get_file_info(&domain_uri)?;
        let problem_file = workspace.get_file_info(&problem_uri)?;
        let domain = domain_file.as_domain()?;
        let problem = problem_file.as_problem()?;
        let request = PlanningRequest {
            domain: domain_file.text().to_string(),
            problem: problem
                .preprocessed_text
                .clone()
                .unwrap_or_else(|| problem_file.text().to_string()),
        };
        Some((request, domain.name.clone(), problem.name.clone(), problem_uri))
    }

    async fn plan_and_display(&self, arguments: &[Value]) -> Result<Option<Value>> {
        let Some((request, domain_name, problem_name, problem_uri)) = self.planning_request(arguments) else {
            return Err(Error::invalid_params(
                "expected a parsed domain and problem, or a problem bound to a domain",
            ));
        };
        let planner = {
            let settings = self.settings.read();
            planner_from_settings(&settings.planner, settings.epsilon)
        };
        let Some(planner) = planner else {
            self.client
                .show_message(MessageType::ERROR, PlanningError::NotConfigured.to_string())
                .await;
            return Ok(None);
        };

        self.planners.insert(problem_uri.clone(), Arc::clone(&planner));
        tracing::info!("Planning {} / {}", domain_name, problem_name);
        let result = planner.plan(&request).await;
        self.planners.remove(&problem_uri);

        match result {
            Ok(outcome) => {
                let plan = outcome.render(&domain_name, &problem_name);
                self.client.log_message(MessageType::INFO, &plan).await;
                self.client
                    .show_message(
                        MessageType::INFO,
                        format!(
                            "Plan for {} found: {} step(s), makespan {:.3}",
                            problem_name,
                            outcome.steps.len(),
                            outcome.makespan()
                        ),
                    )
                    .await;
                Ok(Some(json!({
                    "plan": plan,
                    "makespan": outcome.makespan(),
                    "output": outcome.output,
                })))
            }
            Err(PlanningError::Cancelled) => {
                self.client
                    .show_message(MessageType::INFO, "Planner stopped")
                    .await;
                Ok(None)
            }
            Err(err) => {
                tracing::error!("Planning {} failed: {}", problem_name, err);
                self.client
                    .show_message(MessageType::ERROR, format!("Planning failed: {}", err))
                    .await;
                Ok(None)
            }
        }
    }

    async fn validate(&self, arguments: &[Value]) -> Result<Option<Value>> {
        let Some(uri) = uri_argument(arguments, 0) else {
            return Err(Error::invalid_params("expected a file URI"));
        };
        self.workspace.parse_now().await;
        if let Err(err) = self.validation.validate_now(&uri).await {
            tracing::error!("Validation of {} failed: {}", uri, err);
            self.client
                .show_message(MessageType::ERROR, format!("Validation failed: {}", err))
                .await;
        }
        Ok(None)
    }
}

#[tower_lsp::async_trait]
impl LanguageServer for Backend {
    async fn initialize(&self, params: InitializeParams) -> Result<InitializeResult> {
        self.apply_settings(Settings::from_value(params.initialization_options.as_ref()));

        Ok(InitializeResult {
            server_info: Some(ServerInfo {
                name: SERVER_NAME.to_string(),
                version: Some(crate::VERSION.to_string()),
            }),
            capabilities: ServerCapabilities {
                text_document_sync: Some(TextDocumentSyncCapability::Kind(
                    TextDocumentSyncKind::FULL,
                )),
                definition_provider: Some(OneOf::Left(true)),
                references_provider: Some(OneOf::Left(true)),
                completion_provider: Some(CompletionOptions {
                    trigger_characters: Some(
                        TRIGGER_CHARACTERS.iter().map(|c| c.to_string()).collect(),
                    ),
                    ..Default::default()
                }),
                hover_provider: Some(HoverProviderCapability::Simple(true)),
                document_symbol_provider: Some(OneOf::Left(true)),
                document_formatting_provider: Some(OneOf::Left(true)),
                rename_provider: Some(OneOf::Right(RenameOptions {
                    prepare_provider: Some(true),
                    work_done_progress_options: Default::default(),
                })),
                execute_command_provider: Some(ExecuteCommandOptions {
                    commands: vec![
                        PLAN_COMMAND.to_string(),
                        STOP_PLANNER_COMMAND.to_string(),
                        VALIDATE_COMMAND.to_string(),
                    ],
                    work_done_progress_options: Default::default(),
                }),
                ..Default::default()
            },
        })
    }

    async fn initialized(&self, _: InitializedParams) {
        self.client
            .log_message(MessageType::INFO, "PDDL language server initialized")
            .await;
    }

    async fn shutdown(&self) -> Result<()> {
        for entry in self.planners.iter() {
            entry.value().cancel();
        }
        Ok(())
    }

    async fn did_open(&self, params: DidOpenTextDocumentParams) {
        let document = params.text_document;
        tracing::debug!("Opened {}", document.uri);
        if self.open_documents.insert(document.uri.clone()) {
            // a copy loaded from disk may carry a higher version
            let known = self.workspace.read().contains(&document.uri);
            if known {
                self.workspace.write().remove_file(&document.uri);
            }
        }
        self.workspace
            .upsert_and_parse(&document.uri, document.version, &document.text)
            .await;
        self.load_folder(&document.uri).await;
    }

    async fn did_change(&self, params: DidChangeTextDocumentParams) {
        let uri = params.text_document.uri;
        let version = params.text_document.version;

        if let Some(change) = params.content_changes.into_iter().last() {
            self.workspace
                .upsert_debounced(&uri, version, &change.text)
                .await;
        }
    }

    async fn did_save(&self, params: DidSaveTextDocumentParams) {
        let parsed = self.workspace.parse_now().await;
        tracing::debug!(
            "Saved {}; parsed {} pending file(s)",
            params.text_document.uri,
            parsed.len()
        );
    }

    async fn did_close(&self, params: DidCloseTextDocumentParams) {
        let uri = params.text_document.uri;
        self.open_documents.remove(&uri);
        self.workspace.write().remove_file(&uri);
        // siblings may still bind to it
        self.reload_from_disk(&uri).await;
    }

    async fn did_change_configuration(&self, params: DidChangeConfigurationParams) {
        self.apply_settings(Settings::from_value(Some(&params.settings)));
    }

    async fn did_change_watched_files(&self, params: DidChangeWatchedFilesParams) {
        for change in params.changes {
            if change.typ == FileChangeType::DELETED {
                if !self.open_documents.contains(&change.uri) {
                    self.workspace.write().remove_file(&change.uri);
                }
            } else {
                self.reload_from_disk(&change.uri).await;
            }
        }
    }

    async fn formatting(&self, params: DocumentFormattingParams) -> Result<Option<Vec<TextEdit>>> {
        let uri = params.text_document.uri;

        let current = {
            let workspace = self.workspace.read();
            workspace
                .get_file_info(&uri)
                .map(|file| (file.text().to_string(), file.document.range()))
        };
        let Some((current, range)) = current else {
            return Ok(None);
        };

        let formatted = formatter::format_document(&current);
        if formatted == current {
            return Ok(Some(vec![]));
        }

        Ok(Some(vec![TextEdit {
            range,
            new_text: formatted,
        }]))
    }

    async fn hover(&self, params: HoverParams) -> Result<Option<Hover>> {
        let uri = params.text_document_position_params.text_document.uri;
        let position = params.text_document_position_params.position;

        let symbol = get_symbol_info(&self.workspace.read(), &uri, position);
        Ok(symbol.map(|symbol| Hover {
            contents: HoverContents::Markup(MarkupContent {
                kind: MarkupKind::Markdown,
                value: symbol.hover,
            }),
            range: Some(symbol.range),
        }))
    }

    async fn goto_definition(
        &self,
        params: GotoDefinitionParams,
    ) -> Result<Option<GotoDefinitionResponse>> {
        let uri = params.text_document_position_params.text_document.uri;
        let position = params.text_document_position_params.position;

        let location = get_symbol_info(&self.workspace.read(), &uri, position)
            .and_then(|symbol| symbol.location);
        Ok(location.map(GotoDefinitionResponse::Scalar))
    }

    async fn references(&self, params: ReferenceParams) -> Result<Option<Vec<Location>>> {
        let uri = params.text_document_position.text_document.uri;
        let position = params.text_document_position.position;

        let workspace = self.workspace.read();
        let Some(symbol) = get_symbol_info(&workspace, &uri, position) else {
            return Ok(None);
        };
        Ok(Some(find_symbol_references(
            &workspace,
            &symbol,
            params.context.include_declaration,
        )))
    }

    async fn prepare_rename(
        &self,
        params: TextDocumentPositionParams,
    ) -> Result<Option<PrepareRenameResponse>> {
        let range = symbols::prepare_rename(
            &self.workspace.read(),
            &params.text_document.uri,
            params.position,
        );
        Ok(range.map(PrepareRenameResponse::Range))
    }

    async fn rename(&self, params: RenameParams) -> Result<Option<WorkspaceEdit>> {
        let uri = params.text_document_position.text_document.uri;
        let position = params.text_document_position.position;
        let new_name = params.new_name;

        if !is_valid_name(&new_name) {
            return Err(Error::invalid_params(format!(
                "'{}' is not a valid PDDL name",
                new_name
            )));
        }

        Ok(symbols::rename(
            &self.workspace.read(),
            &uri,
            position,
            &new_name,
        ))
    }

    async fn completion(&self, params: CompletionParams) -> Result<Option<CompletionResponse>> {
        let uri = params.text_document_position.text_document.uri;
        let position = params.text_document_position.position;

        let items = completions(&self.workspace.read(), &uri, position);
        if items.is_empty() {
            return Ok(None);
        }
        Ok(Some(CompletionResponse::Array(items)))
    }

    async fn document_symbol(
        &self,
        params: DocumentSymbolParams,
    ) -> Result<Option<DocumentSymbolResponse>> {
        let workspace = self.workspace.read();
        Ok(workspace
            .get_file_info(&params.text_document.uri)
            .map(|file| DocumentSymbolResponse::Nested(document_symbols(file))))
    }

    async fn execute_command(&self, params: ExecuteCommandParams) -> Result<Option<Value>> {
        tracing::info!("Executing {}", params.command);
        match params.command.as_str() {
            PLAN_COMMAND => self.plan_and_display(&params.arguments).await,
            STOP_PLANNER_COMMAND => {
                let target = uri_argument(&params.arguments, 0);
                for entry in self.planners.iter() {
                    if target.as_ref().map_or(true, |uri| uri == entry.key()) {
                        entry.value().cancel();
                    }
                }
                Ok(None)
            }
            VALIDATE_COMMAND => self.validate(&params.arguments).await,
            other => Err(Error::invalid_params(format!("Unknown command: {}", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tower_lsp::LspService;

    fn open(uri: &Url, version: i32, text: &str) -> DidOpenTextDocumentParams {
        DidOpenTextDocumentParams {
            text_document: TextDocumentItem {
                uri: uri.clone(),
                language_id: "pddl".to_string(),
                version,
                text: text.to_string(),
            },
        }
    }

    fn changed_on_disk(uri: &Url) -> DidChangeWatchedFilesParams {
        DidChangeWatchedFilesParams {
            changes: vec![FileEvent {
                uri: uri.clone(),
                typ: FileChangeType::CHANGED,
            }],
        }
    }

    fn stored(backend: &Backend, uri: &Url) -> (i32, String) {
        let workspace = backend.workspace.read();
        let info = workspace.get_file_info(uri).unwrap();
        (info.version, info.text().to_string())
    }

    #[tokio::test]
    async fn disk_changes_do_not_override_open_documents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("domain.pddl");
        std::fs::write(&path, "(define (domain on-disk))").unwrap();
        let uri = Url::from_file_path(&path).unwrap();
        let (service, _socket) = LspService::new(Backend::new);
        let backend = service.inner();

        backend.did_open(open(&uri, 5, "(define (domain edited))")).await;
        backend.did_change_watched_files(changed_on_disk(&uri)).await;
        assert_eq!(stored(backend, &uri), (5, "(define (domain edited))".to_string()));

        backend
            .did_change(DidChangeTextDocumentParams {
                text_document: VersionedTextDocumentIdentifier {
                    uri: uri.clone(),
                    version: 6,
                },
                content_changes: vec![TextDocumentContentChangeEvent {
                    range: None,
                    range_length: None,
                    text: "(define (domain renamed))".to_string(),
                }],
            })
            .await;
        backend.workspace.parse_now().await;
        assert_eq!(stored(backend, &uri), (6, "(define (domain renamed))".to_string()));

        backend
            .did_close(DidCloseTextDocumentParams {
                text_document: TextDocumentIdentifier { uri: uri.clone() },
            })
            .await;
        assert_eq!(
            stored(backend, &uri),
            (DISK_VERSION, "(define (domain on-disk))".to_string())
        );
    }

    #[tokio::test]
    async fn opening_a_file_loaded_from_disk_uses_the_editor_text() {
        let dir = tempfile::tempdir().unwrap();
        let domain_path = dir.path().join("domain.pddl");
        let problem_path = dir.path().join("p1.pddl");
        std::fs::write(&domain_path, "(define (domain d))").unwrap();
        std::fs::write(&problem_path, "(define (problem p1) (:domain d))").unwrap();
        let domain = Url::from_file_path(&domain_path).unwrap();
        let problem = Url::from_file_path(&problem_path).unwrap();
        let (service, _socket) = LspService::new(Backend::new);
        let backend = service.inner();

        backend.did_open(open(&domain, 1, "(define (domain d))")).await;
        assert_eq!(stored(backend, &problem).0, DISK_VERSION);
        std::fs::write(&problem_path, "(define (problem p2) (:domain d))").unwrap();
        backend.did_change_watched_files(changed_on_disk(&problem)).await;
        assert_eq!(stored(backend, &problem).0, DISK_VERSION + 1);

        let text = "(define (problem edited) (:domain d))";
        backend.did_open(open(&problem, 0, text)).await;
        assert_eq!(stored(backend, &problem), (0, text.to_string()));
    }
}
