//! CLI route: single route table and run context. Dispatches to the engine and formats output.

use crate::cli::parse::{
    CheckpointCommands, Commands, ConfigCommands, DraftCommands, WorkbenchCommands,
};
use crate::config::{ConfigLoader, EngineConfig};
use crate::engine::Engine;
use crate::error::{ErrorInfo, Phase};
use crate::notify::NullNotifier;
use crate::rpc::{self, ChannelNotifier};
use crate::store::{FileEntry, Tree, WorkbenchMeta};
use crate::checkpoint::Checkpoint;
use crate::types::WorkbenchId;
use comfy_table::presets::UTF8_BORDERS_ONLY;
use comfy_table::Table;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

/// Runtime context for CLI execution: the effective configuration.
pub struct RunContext {
    config: EngineConfig,
}

impl RunContext {
    /// Load configuration from `config_path` or the layered sources, then apply CLI overrides.
    pub fn new(
        workbenches_dir: Option<PathBuf>,
        config_path: Option<PathBuf>,
    ) -> Result<Self, ErrorInfo> {
        let mut config = load_config(config_path.as_deref())?;
        if let Some(dir) = workbenches_dir {
            config.workbenches_dir = Some(dir);
        }
        Ok(Self { config })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn engine(&self) -> Result<Engine, ErrorInfo> {
        check_config(&self.config)?;
        Engine::from_config(self.config.clone(), Arc::new(NullNotifier))
    }

    /// Execute a CLI command via the single route table.
    pub async fn execute(&self, command: &Commands) -> Result<String, ErrorInfo> {
        match command {
            Commands::Serve => self.serve().await,
            Commands::Workbench { command } => self.workbench(command).await,
            Commands::Draft { command } => self.draft(command).await,
            Commands::Checkpoint { command } => self.checkpoint(command).await,
            Commands::Config { command } => self.config_command(command),
        }
    }

    async fn serve(&self) -> Result<String, ErrorInfo> {
        check_config(&self.config)?;
        let (notifier, notifications) = ChannelNotifier::new();
        let engine = Arc::new(Engine::from_config(
            self.config.clone(),
            Arc::new(notifier),
        )?);
        info!(
            workbenches_dir = %self.config.resolved_workbenches_dir().display(),
            "Serving"
        );
        rpc::serve(engine, notifications, tokio::io::stdin(), tokio::io::stdout())
            .await
            .map_err(|e| ErrorInfo::file_write(Phase::Settings, format!("stdio closed: {e}")))?;
        Ok(String::new())
    }

    async fn workbench(&self, command: &WorkbenchCommands) -> Result<String, ErrorInfo> {
        let engine = self.engine()?;
        match command {
            WorkbenchCommands::Create { name } => {
                let meta = engine.create_workbench(name)?;
                Ok(format!("Created workbench {} ({})", meta.id, meta.name))
            }
            WorkbenchCommands::List { format } => {
                let list = engine.list_workbenches()?;
                if format == "json" {
                    return to_json(&list);
                }
                Ok(format_workbenches(&list))
            }
            WorkbenchCommands::Delete { workbench_id } => {
                let id = parse_id(workbench_id)?;
                engine.delete_workbench(&id).await?;
                Ok(format!("Deleted workbench {id}"))
            }
            WorkbenchCommands::AddFiles {
                workbench_id,
                paths,
            } => {
                let id = parse_id(workbench_id)?;
                let added = engine.add_files(&id, paths).await?;
                Ok(format!(
                    "Added {} file(s) to {id}\n{}",
                    added.len(),
                    format_files(&added)
                ))
            }
            WorkbenchCommands::Files {
                workbench_id,
                draft,
                format,
            } => {
                let id = parse_id(workbench_id)?;
                let tree = if *draft { Tree::Draft } else { Tree::Published };
                let files = engine.list_files(&id, tree)?;
                if format == "json" {
                    return to_json(&files);
                }
                Ok(format_files(&files))
            }
        }
    }

    async fn draft(&self, command: &DraftCommands) -> Result<String, ErrorInfo> {
        let engine = self.engine()?;
        match command {
            DraftCommands::State { workbench_id } => {
                let view = engine.draft_state(&parse_id(workbench_id)?)?;
                if !view.has_draft {
                    return Ok("No draft".to_string());
                }
                Ok(format!(
                    "Draft {} (created {}, source {})",
                    view.draft_id.unwrap_or_default(),
                    view.created_at.unwrap_or_default(),
                    view.source_kind.unwrap_or_default()
                ))
            }
            DraftCommands::Create { workbench_id } => {
                let view = engine.create_draft(&parse_id(workbench_id)?).await?;
                Ok(format!("Created draft {}", view.draft_id.unwrap_or_default()))
            }
            DraftCommands::Publish {
                workbench_id,
                confirm_deletions,
            } => {
                let outcome = engine
                    .publish(&parse_id(workbench_id)?, *confirm_deletions)
                    .await?;
                Ok(format!(
                    "Published {} file(s), checkpoint {}",
                    outcome.files, outcome.checkpoint_id
                ))
            }
            DraftCommands::Discard { workbench_id } => {
                if engine.discard(&parse_id(workbench_id)?).await? {
                    Ok("Draft discarded".to_string())
                } else {
                    Ok("No draft".to_string())
                }
            }
        }
    }

    async fn checkpoint(&self, command: &CheckpointCommands) -> Result<String, ErrorInfo> {
        let engine = self.engine()?;
        match command {
            CheckpointCommands::List {
                workbench_id,
                format,
            } => {
                let list = engine.list_checkpoints(&parse_id(workbench_id)?)?;
                if format == "json" {
                    return to_json(&list);
                }
                Ok(format_checkpoints(&list))
            }
            CheckpointCommands::Create {
                workbench_id,
                description,
            } => {
                let checkpoint = engine
                    .create_checkpoint(&parse_id(workbench_id)?, description)
                    .await?;
                Ok(format!("Created checkpoint {}", checkpoint.checkpoint_id))
            }
            CheckpointCommands::Restore {
                workbench_id,
                checkpoint_id,
            } => {
                let outcome = engine
                    .restore_checkpoint(&parse_id(workbench_id)?, checkpoint_id)
                    .await?;
                if !outcome.restored {
                    return Ok(format!(
                        "Published tree already matches {}",
                        outcome.checkpoint_id
                    ));
                }
                Ok(format!(
                    "Restored {} (previous state saved as {})",
                    outcome.checkpoint_id,
                    outcome.pre_restore_checkpoint_id.unwrap_or_default()
                ))
            }
        }
    }

    fn config_command(&self, command: &ConfigCommands) -> Result<String, ErrorInfo> {
        match command {
            ConfigCommands::Show => self
                .config
                .to_toml_string()
                .map_err(|e| ErrorInfo::validation(Phase::Settings, e.to_string())),
            ConfigCommands::Validate => {
                check_config(&self.config)?;
                Ok("Configuration is valid".to_string())
            }
        }
    }
}

fn load_config(config_path: Option<&Path>) -> Result<EngineConfig, ErrorInfo> {
    let loaded = match config_path {
        Some(path) => ConfigLoader::load_from_file(path),
        None => ConfigLoader::load(Path::new(".")),
    };
    loaded.map_err(|e| ErrorInfo::validation(Phase::Settings, e.to_string()))
}

fn check_config(config: &EngineConfig) -> Result<(), ErrorInfo> {
    config.validate().map_err(|errors| {
        let lines: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
        ErrorInfo::validation(Phase::Settings, lines.join("; "))
    })
}

fn parse_id(raw: &str) -> Result<WorkbenchId, ErrorInfo> {
    WorkbenchId::parse(raw).map_err(|e| e.into_info(Phase::Workbench))
}

fn to_json<T: Serialize>(value: &T) -> Result<String, ErrorInfo> {
    serde_json::to_string_pretty(value)
        .map_err(|e| ErrorInfo::validation(Phase::Workbench, format!("failed to encode: {e}")))
}

/// Snake-case serde label of a unit enum.
fn label<T: Serialize>(value: &T) -> String {
    serde_json::to_value(value)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default()
}

fn format_workbenches(list: &[WorkbenchMeta]) -> String {
    if list.is_empty() {
        return "No workbenches.".to_string();
    }
    let mut table = Table::new();
    table.load_preset(UTF8_BORDERS_ONLY);
    table.set_header(vec!["Id", "Name", "Updated"]);
    for meta in list {
        table.add_row(vec![
            meta.id.to_string(),
            meta.name.clone(),
            meta.updated_at.clone(),
        ]);
    }
    table.to_string()
}

fn format_files(files: &[FileEntry]) -> String {
    if files.is_empty() {
        return "No files.".to_string();
    }
    let mut table = Table::new();
    table.load_preset(UTF8_BORDERS_ONLY);
    table.set_header(vec!["Path", "Kind", "Size"]);
    for entry in files {
        table.add_row(vec![
            entry.path.clone(),
            label(&entry.kind),
            entry.size.to_string(),
        ]);
    }
    table.to_string()
}

fn format_checkpoints(list: &[Checkpoint]) -> String {
    if list.is_empty() {
        return "No checkpoints.".to_string();
    }
    let mut table = Table::new();
    table.load_preset(UTF8_BORDERS_ONLY);
    table.set_header(vec!["Id", "Reason", "Created", "Files", "Description"]);
    for checkpoint in list {
        table.add_row(vec![
            checkpoint.checkpoint_id.clone(),
            label(&checkpoint.reason),
            checkpoint.created_at.clone(),
            checkpoint.stats.files.to_string(),
            checkpoint.description.clone(),
        ]);
    }
    table.to_string()
}
