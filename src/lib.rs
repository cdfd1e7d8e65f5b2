use zed_extension_api::{self as zed, LanguageServerId, Result};

const SERVER_BINARY: &str = "pddl-lsp";

struct PddlExtension;

impl zed::Extension for PddlExtension {
    fn new() -> Self {
        Self
    }

    fn language_server_command(
        &mut self,
        language_server_id: &LanguageServerId,
        worktree: &zed::Worktree,
    ) -> Result<zed::Command> {
        if language_server_id.as_ref() != SERVER_BINARY {
            return Err(format!(
                "Unknown language server: {}",
                language_server_id.as_ref()
            ));
        }

        let command = worktree.which(SERVER_BINARY).ok_or_else(|| {
            format!(
                "{} was not found on PATH; install it with `cargo install --path language-server`",
                SERVER_BINARY
            )
        })?;

        Ok(zed::Command {
            command,
            args: vec![],
            env: worktree.shell_env(),
        })
    }
}

zed::register_extension!(PddlExtension);
