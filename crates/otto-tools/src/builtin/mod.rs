// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
pub mod background;
pub mod bash;
pub mod copy_move;
pub mod delete_file;
pub mod edit_file;
pub mod find_file;
pub mod grep;
pub mod list_dir;
pub mod multi_edit;
pub mod read_file;
pub mod write_file;

pub use background::{
    register_background_tools, BackgroundProcessTable, CheckBackgroundProcessTool,
    StartBackgroundProcessTool, StopBackgroundProcessTool,
};
pub use bash::BashTool;
pub use copy_move::{CopyFileTool, MoveFileTool};
pub use delete_file::DeleteFileTool;
pub use edit_file::EditFileTool;
pub use find_file::FindFileTool;
pub use grep::GrepTool;
pub use list_dir::ListDirTool;
pub use multi_edit::MultiEditTool;
pub use read_file::ReadFileTool;
pub use write_file::WriteFileTool;

use crate::ToolRegistry;

/// Register the full builtin tool set, skipping names in `disabled`.
pub fn register_builtins(reg: &mut ToolRegistry, disabled: &[String]) {
    let off: Vec<String> = disabled.iter().map(|s| s.to_lowercase()).collect();
    let allow = |name: &str| !off.contains(&name.to_string());

    if allow("read_file") {
        reg.register(ReadFileTool);
    }
    if allow("write_file") {
        reg.register(WriteFileTool);
    }
    if allow("edit_file") {
        reg.register(EditFileTool);
    }
    if allow("multi_edit") {
        reg.register(MultiEditTool);
    }
    if allow("copy_file") {
        reg.register(CopyFileTool);
    }
    if allow("move_file") {
        reg.register(MoveFileTool);
    }
    if allow("delete_file") {
        reg.register(DeleteFileTool);
    }
    if allow("list_dir") {
        reg.register(ListDirTool);
    }
    if allow("grep") {
        reg.register(GrepTool);
    }
    if allow("find_file") {
        reg.register(FindFileTool);
    }
    if allow("bash") {
        reg.register(BashTool::default());
    }
}
