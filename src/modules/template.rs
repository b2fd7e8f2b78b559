// Variable substitution for command strings

/// Values available to `SPOT_*` placeholders
#[derive(Debug, Clone, Copy, Default)]
pub struct TemplateScope<'a> {
    pub host: &'a str,
    pub command: &'a str,
    pub user: &'a str,
    pub task: &'a str,
    pub error: Option<&'a str>,
}

fn apply(input: &str, name: &str, value: &str) -> String {
    input
        .replace(&format!("${{{}}}", name), value)
        .replace(&format!("${}", name), value)
        .replace(&format!("{{{}}}", name), value)
}

/// Replace `${NAME}`, `$NAME` and `{NAME}` for every spot variable.
///
/// Variables are applied one after another in a fixed order (host, command,
/// user, task, error); a substituted value is visible to the later passes.
pub fn render(input: &str, scope: &TemplateScope<'_>) -> String {
    let res = apply(input, "SPOT_REMOTE_HOST", scope.host);
    let res = apply(&res, "SPOT_COMMAND", scope.command);
    let res = apply(&res, "SPOT_REMOTE_USER", scope.user);
    let res = apply(&res, "SPOT_TASK", scope.task);
    apply(&res, "SPOT_ERROR", scope.error.unwrap_or_default())
}
