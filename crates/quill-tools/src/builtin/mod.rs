// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
pub mod bash;
pub mod edit;
pub mod fetch;
pub mod glob;
pub mod grep;
pub mod job;
pub mod lsp;
pub mod ls;
pub mod mcp;
pub mod multiedit;
pub mod sourcegraph;
pub mod todos;
pub mod view;
pub mod web;
pub mod write_file;

// ─── parallel_safe contract tests ────────────────────────────────────────────
//
// Read-only tools may run concurrently within one turn; anything that
// mutates files, processes, or session state must stay serialized.  Each
// builtin is pinned here so a copy-paste or refactor cannot silently flip
// a mutating tool to concurrent execution.
#[cfg(test)]
mod parallel_safe_tests {
    use std::sync::Arc;

    use quill_config::PermissionConfig;
    use quill_store::{FileHistoryStore, SessionStore};

    use crate::fsutil::FileGuard;
    use crate::permission::PermissionService;
    use crate::shell::BackgroundShellManager;
    use crate::Tool;

    fn guard() -> Arc<FileGuard> {
        Arc::new(FileGuard::new(FileHistoryStore::new()))
    }

    fn perms() -> Arc<PermissionService> {
        PermissionService::new(&PermissionConfig::default())
    }

    // ── Read-only tools run in parallel ───────────────────────────────────────

    #[test]
    fn view_is_parallel_safe() {
        let t = super::view::ViewTool { guard: guard(), permissions: perms(), skills_paths: vec![] };
        assert!(t.parallel_safe());
    }

    #[test]
    fn grep_is_parallel_safe() {
        assert!(super::grep::GrepTool.parallel_safe());
    }

    #[test]
    fn glob_is_parallel_safe() {
        assert!(super::glob::GlobTool.parallel_safe());
    }

    #[test]
    fn ls_is_parallel_safe() {
        assert!(super::ls::LsTool::default().parallel_safe());
    }

    #[test]
    fn fetch_is_parallel_safe() {
        let t = super::fetch::FetchTool { permissions: perms(), default_timeout_secs: 30 };
        assert!(t.parallel_safe());
    }

    #[test]
    fn web_fetch_and_search_are_parallel_safe() {
        assert!(super::web::WebFetchTool.parallel_safe());
        assert!(super::web::WebSearchTool { api_key: None }.parallel_safe());
    }

    #[test]
    fn sourcegraph_is_parallel_safe() {
        assert!(super::sourcegraph::SourcegraphTool { endpoint: None }.parallel_safe());
    }

    #[test]
    fn job_output_is_parallel_safe() {
        let t = super::job::JobOutputTool { manager: BackgroundShellManager::new() };
        assert!(t.parallel_safe());
    }

    // ── Mutating tools stay serialized ────────────────────────────────────────

    #[test]
    fn bash_is_serialized() {
        let t = super::bash::BashTool {
            manager: BackgroundShellManager::new(),
            permissions: perms(),
            blockers: vec![],
            sync_wait: std::time::Duration::from_secs(60),
        };
        assert!(!t.parallel_safe());
    }

    #[test]
    fn edit_tools_are_serialized() {
        assert!(!super::edit::EditTool { guard: guard(), permissions: perms() }.parallel_safe());
        assert!(
            !super::multiedit::MultiEditTool { guard: guard(), permissions: perms() }
                .parallel_safe()
        );
        assert!(
            !super::write_file::WriteTool { guard: guard(), permissions: perms() }.parallel_safe()
        );
    }

    #[test]
    fn job_kill_is_serialized() {
        let t = super::job::JobKillTool { manager: BackgroundShellManager::new() };
        assert!(!t.parallel_safe());
    }

    #[test]
    fn todos_is_serialized() {
        let t = super::todos::TodosTool { sessions: SessionStore::new() };
        assert!(!t.parallel_safe());
    }

    #[test]
    fn download_is_serialized() {
        let t = super::fetch::DownloadTool { permissions: perms() };
        assert!(!t.parallel_safe());
    }
}
