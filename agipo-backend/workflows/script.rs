//! Turn a chain into one shell invocation.
//!
//! Every node's code is written verbatim to its own scratch file, then the
//! scratch files are run by the interpreter joined with `|`, so each node's
//! stdout is the next node's stdin. A pipeline only reports its last
//! stage's status, so every stage also writes its own status to an exit
//! file and the command ends by exiting with the first non-zero one.

use super::graph::Chain;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptOptions {
    /// Scratch directory, relative to the sandbox root. Created if missing.
    pub workdir: String,
    /// Interpreter command line. Inserted unquoted so it may carry flags.
    pub interpreter: String,
    pub extension: String,
}

impl Default for ScriptOptions {
    fn default() -> Self {
        Self {
            workdir: "workflow".into(),
            interpreter: "node".into(),
            extension: "js".into(),
        }
    }
}

/// Single-quote `s` for a POSIX shell. Inner quotes become `'\''`.
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Deterministic, collision-free file name for a node id.
///
/// `[A-Za-z0-9-]` pass through; every other byte becomes `_` plus two hex
/// digits, so distinct ids never share a file.
pub fn scratch_file_name(node_id: &str, extension: &str) -> String {
    let mut name = String::from("node_");
    for byte in node_id.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' {
            name.push(byte as char);
        } else {
            name.push_str(&format!("_{byte:02x}"));
        }
    }
    name.push('.');
    name.push_str(extension);
    name
}

/// Where a node's pipeline stage records its exit status.
pub fn exit_file_name(node_id: &str, extension: &str) -> String {
    format!("{}.exit", scratch_file_name(node_id, extension))
}

/// `printf '%s' '<code>' > <file>` per node, joined with `&&`.
pub fn build_write_commands(chain: &Chain, opts: &ScriptOptions) -> String {
    chain
        .nodes()
        .iter()
        .map(|node| {
            format!(
                "printf '%s' {} > {}",
                shell_quote(&node.code),
                shell_quote(&scratch_file_name(&node.id, &opts.extension))
            )
        })
        .collect::<Vec<_>>()
        .join(" && ")
}

/// `{ <interpreter> <file>; echo $? > <exit file>; }` per node, joined
/// with `|`.
pub fn build_execute_commands(chain: &Chain, opts: &ScriptOptions) -> String {
    chain
        .nodes()
        .iter()
        .map(|node| {
            format!(
                "{{ {} {}; echo $? > {}; }}",
                opts.interpreter,
                shell_quote(&scratch_file_name(&node.id, &opts.extension)),
                shell_quote(&exit_file_name(&node.id, &opts.extension))
            )
        })
        .collect::<Vec<_>>()
        .join(" | ")
}

/// Exit with the first non-zero stage status, in chain order. A missing
/// exit file counts as status 1.
pub fn build_status_check(chain: &Chain, opts: &ScriptOptions) -> String {
    let files = chain
        .nodes()
        .iter()
        .map(|node| shell_quote(&exit_file_name(&node.id, &opts.extension)))
        .collect::<Vec<_>>()
        .join(" ");
    format!(
        r#"for f in {files}; do code=$(cat "$f" 2>/dev/null); [ "${{code:-1}}" = 0 ] || exit "${{code:-1}}"; done"#
    )
}

/// Change into the scratch directory, write every file, run the pipeline,
/// then check every stage's status. An empty chain only changes directory.
pub fn build_full_command(chain: &Chain, opts: &ScriptOptions) -> String {
    let mut parts = vec![workdir_prelude(opts)];
    if !chain.is_empty() {
        parts.push(build_write_commands(chain, opts));
        parts.push(build_execute_commands(chain, opts));
        parts.push(build_status_check(chain, opts));
    }
    parts.join(" && ")
}

/// `mkdir -p <dir> && cd <dir>`, shared with dependency installs.
pub fn workdir_prelude(opts: &ScriptOptions) -> String {
    let dir = shell_quote(&opts.workdir);
    format!("mkdir -p {dir} && cd {dir}")
}
