//! Shell script generation for stage payloads
//!
//! Pure data-to-text. Values taken from the pipeline description are always
//! single-quoted; only the description's own commands are emitted verbatim.

/// Directory per-stack outputs are captured into
pub const STACK_OUTPUTS_DIR: &str = "/tmp/outputs";

/// Consolidated outputs file read by the engine after a deploy stage
pub const STACK_OUTPUTS_FILE: &str = "/tmp/stack-outputs.json";

/// File the build stage writes its artifact location to
pub const ARTIFACT_PATH_FILE: &str = "/tmp/artifact-path";

/// Where every stage checks the repository out
pub const WORKSPACE_DIR: &str = "/workspace";

/// Quote a value for POSIX shells
pub fn shell_quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/' | ':' | '='))
    {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Builds a bash script line by line
#[derive(Debug, Clone)]
pub struct ScriptBuilder {
    lines: Vec<String>,
}

impl Default for ScriptBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptBuilder {
    pub fn new() -> Self {
        Self {
            lines: vec!["set -euo pipefail".to_string()],
        }
    }

    /// Emit a line verbatim
    pub fn raw(&mut self, line: impl Into<String>) -> &mut Self {
        self.lines.push(line.into());
        self
    }

    pub fn blank(&mut self) -> &mut Self {
        self.lines.push(String::new());
        self
    }

    pub fn echo(&mut self, message: &str) -> &mut Self {
        self.lines.push(format!("echo {}", shell_quote(message)));
        self
    }

    pub fn export(&mut self, name: &str, value: &str) -> &mut Self {
        self.lines.push(format!("export {}={}", name, shell_quote(value)));
        self
    }

    /// Clone the repository and check out the triggering commit
    ///
    /// Expects `REPO_URL` and `COMMIT_SHA` in the environment.
    pub fn checkout(&mut self) -> &mut Self {
        self.echo("Cloning repository...")
            .raw(format!("git clone \"$REPO_URL\" {WORKSPACE_DIR}"))
            .raw(format!("cd {WORKSPACE_DIR}"))
            .raw("git checkout \"$COMMIT_SHA\"")
    }

    /// Announce and run a user-supplied command
    pub fn command(&mut self, command: &str) -> &mut Self {
        self.echo(&format!("+ {command}")).raw(command)
    }

    /// Run a user-supplied command, counting a failure instead of exiting
    pub fn counted_command(&mut self, command: &str, counter: &str) -> &mut Self {
        self.echo(&format!("+ {command}")).raw(format!(
            "( {command} ) || {counter}=$(({counter} + 1))"
        ))
    }

    /// Synthesize, deploy and capture outputs for one stack
    ///
    /// `path` is the infrastructure app directory relative to the workspace.
    pub fn stack_deployment(&mut self, stack: &str, path: &str, region: &str) -> &mut Self {
        let quoted = shell_quote(stack);
        let outputs = shell_quote(&format!("{STACK_OUTPUTS_DIR}/{stack}.json"));
        self.raw(format!("cd {WORKSPACE_DIR}"))
            .raw(format!("cd {}", shell_quote(path)))
            .raw("if [ -f package.json ]; then npm install; fi")
            .echo(&format!("Synthesizing stack: {stack}"))
            .raw(format!("npx cdk synth {quoted}"))
            .echo(&format!("Deploying stack: {stack}"))
            .raw(format!("npx cdk deploy {quoted} --require-approval never"))
            .echo(&format!("Capturing outputs for stack: {stack}"))
            .raw(format!(
                "aws cloudformation describe-stacks --stack-name {quoted} --region {} --query 'Stacks[0].Outputs' --output json > {outputs} || echo null > {outputs}",
                shell_quote(region),
            ))
    }

    /// Merge per-stack outputs into one JSON object keyed by stack name
    pub fn consolidate_outputs(&mut self, stacks: &[&str]) -> &mut Self {
        self.echo("Consolidating stack outputs...");
        self.raw("{");
        self.raw("  printf '{'");
        for (index, stack) in stacks.iter().enumerate() {
            let outputs = format!("{STACK_OUTPUTS_DIR}/{stack}.json");
            self.raw(format!("  printf '\"%s\":' {}", shell_quote(stack)));
            self.raw(format!("  cat {}", shell_quote(&outputs)));
            if index + 1 < stacks.len() {
                self.raw("  printf ','");
            }
        }
        self.raw("  printf '}'");
        self.raw(format!("}} > {STACK_OUTPUTS_FILE}"))
    }

    pub fn build(&self) -> String {
        let mut script = self.lines.join("\n");
        script.push('\n');
        script
    }
}
