use colored::{ColoredString, Colorize};
use declarative::{
    Action, ApplySummary, ChangeReason, Diagnostic, Diagnostics, OutputChange, Plan,
    ResourceInstanceChange, ResourceInstanceObject, Severity, State,
};
use std::collections::BTreeSet;
use valuekit::{Path, PathSet, Value};

/// Print an info message
pub fn info(msg: &str) {
    println!("{} {}", "ℹ".blue(), msg);
}

/// Print a success message
pub fn success(msg: &str) {
    println!("{} {}", "✓".green(), msg);
}

/// Print a warning message
pub fn warn(msg: &str) {
    println!("{} {}", "⚠".yellow(), msg);
}

/// Print an error message
pub fn error(msg: &str) {
    eprintln!("{} {}", "✗".red(), msg);
}

/// Print a dim/muted message
pub fn dim(msg: &str) {
    println!("  {}", msg.dimmed());
}

/// Print a header/title
pub fn header(title: &str) {
    println!();
    println!("{}", title.bold());
    println!("{}", "─".repeat(title.chars().count()).dimmed());
}

/// Print a section header
pub fn section(title: &str) {
    println!();
    println!("{}", title.cyan().bold());
}

/// Print a key-value pair
pub fn kv(key: &str, value: &str) {
    println!("  {}: {}", key.dimmed(), value);
}

// ============================================================================
// Values
// ============================================================================

const SENSITIVE: &str = "(sensitive value)";

fn paint(action: Action, text: &str) -> ColoredString {
    match action {
        Action::Create => text.green(),
        Action::Update => text.yellow(),
        Action::Delete => text.red(),
        Action::Replace(_) => text.magenta(),
        Action::Read => text.cyan(),
        Action::NoOp => text.normal(),
    }
}

/// Render a value for display, hiding it if sensitive
pub fn format_value(value: &Value, sensitive: bool) -> String {
    if sensitive {
        SENSITIVE.to_string()
    } else {
        value.to_string()
    }
}

fn top_level_keys<'a>(before: Option<&'a Value>, after: Option<&'a Value>) -> BTreeSet<&'a str> {
    [before, after]
        .into_iter()
        .flatten()
        .filter_map(Value::as_object)
        .flat_map(|attrs| attrs.keys().map(String::as_str))
        .collect()
}

// ============================================================================
// Plans
// ============================================================================

/// One-line description of what a change does
pub fn change_title(change: &ResourceInstanceChange) -> String {
    let verb = match change.action {
        Action::Create => "will be created",
        Action::Update => "will be updated in-place",
        Action::Delete => "will be destroyed",
        Action::Replace(_) => "must be replaced",
        Action::Read => "will be read during apply",
        Action::NoOp => "is unchanged",
    };
    let mut title = format!(
        "{} {} {verb}",
        paint(change.action, change.action.symbol()),
        change.display_addr().bold()
    );
    if let Some(reason) = change.reason {
        let why = match reason {
            ChangeReason::Tainted => "tainted",
            ChangeReason::RequiresReplace => "an attribute forces replacement",
            ChangeReason::NoConfiguration => "no longer in configuration",
            ChangeReason::DestroyMode => "destroy requested",
            ChangeReason::Deposed => "left over from a replacement",
            ChangeReason::SensitivityChanged => "sensitivity changed",
        };
        title.push_str(&format!(" {}", format!("({why})").dimmed()));
    }
    title
}

/// Attribute lines under a change title
pub fn attribute_lines(change: &ResourceInstanceChange) -> Vec<String> {
    let before = change.before.as_ref();
    let after = change.after.as_ref();
    let mut lines = Vec::new();
    let mut unchanged = 0;

    for key in top_level_keys(before, after) {
        let path = Path::root().key(key);
        let old = before.and_then(|v| v.attr(key)).unwrap_or(&Value::Null);
        let new = after.and_then(|v| v.attr(key)).unwrap_or(&Value::Null);
        let old_sensitive = is_sensitive(&change.before_sensitive, &path);
        let new_sensitive = is_sensitive(&change.after_sensitive, &path);

        let line = match change.action {
            Action::Delete if !old.is_null() => {
                Some(format!("{} {key} = {}", "-".red(), format_value(old, old_sensitive)))
            }
            Action::Create | Action::Read if !new.is_null() => {
                Some(format!("{} {key} = {}", "+".green(), format_value(new, new_sensitive)))
            }
            Action::Update | Action::Replace(_) if old != new || old_sensitive != new_sensitive => {
                Some(changed_line(key, old, new, old_sensitive, new_sensitive))
            }
            Action::Update | Action::Replace(_) => {
                unchanged += 1;
                None
            }
            _ => None,
        };

        if let Some(mut line) = line {
            if change.requires_replace.contains(&path) {
                line.push_str(&format!(" {}", "# forces replacement".red()));
            }
            lines.push(line);
            if let (Some(a), Some(b)) = (old.as_str(), new.as_str())
                && !old_sensitive
                && !new_sensitive
                && (a.contains('\n') || b.contains('\n'))
            {
                lines.extend(text_diff(a, b));
            }
        }
    }

    if unchanged > 0 {
        let noun = if unchanged == 1 { "attribute" } else { "attributes" };
        lines.push(format!("# ({unchanged} unchanged {noun} hidden)").dimmed().to_string());
    }
    lines
}

fn is_sensitive(marks: &PathSet, path: &Path) -> bool {
    marks.covers(path)
}

fn changed_line(
    key: &str,
    old: &Value,
    new: &Value,
    old_sensitive: bool,
    new_sensitive: bool,
) -> String {
    if old.is_null() {
        return format!("{} {key} = {}", "+".green(), format_value(new, new_sensitive));
    }
    if new.is_null() {
        return format!("{} {key} = {}", "-".red(), format_value(old, old_sensitive));
    }
    format!(
        "{} {key} = {} -> {}",
        "~".yellow(),
        format_value(old, old_sensitive),
        format_value(new, new_sensitive)
    )
}

/// Line diff of two multi-line strings
fn text_diff(old: &str, new: &str) -> Vec<String> {
    let diff = similar::TextDiff::from_lines(old, new);
    diff.iter_all_changes()
        .filter_map(|change| {
            let text = change.value().trim_end_matches('\n');
            match change.tag() {
                similar::ChangeTag::Delete => Some(format!("    {}", format!("- {text}").red())),
                similar::ChangeTag::Insert => Some(format!("    {}", format!("+ {text}").green())),
                similar::ChangeTag::Equal => None,
            }
        })
        .collect()
}

fn output_line(change: &OutputChange) -> String {
    let name = change.addr.to_string();
    let value = |v: Option<&Value>| format_value(v.unwrap_or(&Value::Null), change.sensitive);
    match change.action {
        Action::Create => format!("{} {name} = {}", "+".green(), value(change.after.as_ref())),
        Action::Delete => format!("{} {name} = {}", "-".red(), value(change.before.as_ref())),
        _ => format!(
            "{} {name} = {} -> {}",
            "~".yellow(),
            value(change.before.as_ref()),
            value(change.after.as_ref())
        ),
    }
}

/// Counts for the plan footer: add, change, destroy
pub fn plan_counts(plan: &Plan) -> (usize, usize, usize) {
    let mut counts = (0, 0, 0);
    for change in plan.changes.actionable() {
        match change.action {
            Action::Create => counts.0 += 1,
            Action::Update => counts.1 += 1,
            Action::Delete => counts.2 += 1,
            Action::Replace(_) => {
                counts.0 += 1;
                counts.2 += 1;
            }
            Action::Read | Action::NoOp => {}
        }
    }
    counts
}

/// Full plan rendering, one entry per line
pub fn render_plan(plan: &Plan) -> Vec<String> {
    let mut lines = Vec::new();
    for change in plan.changes.actionable() {
        lines.push(format!("  {}", change_title(change)));
        for attr in attribute_lines(change) {
            lines.push(format!("      {attr}"));
        }
        lines.push(String::new());
    }

    let outputs: Vec<&OutputChange> = plan
        .changes
        .outputs
        .iter()
        .filter(|o| o.action.is_change())
        .collect();
    if !outputs.is_empty() {
        lines.push("Changes to outputs:".bold().to_string());
        for change in outputs {
            lines.push(format!("  {}", output_line(change)));
        }
        lines.push(String::new());
    }

    let (add, change, destroy) = plan_counts(plan);
    lines.push(format!(
        "{} {add} to add, {change} to change, {destroy} to destroy.",
        "Plan:".bold()
    ));
    lines
}

pub fn print_plan(plan: &Plan) {
    if plan.changes.is_empty() {
        success("No changes. Infrastructure matches the configuration.");
        return;
    }
    println!();
    for line in render_plan(plan) {
        println!("{line}");
    }
}

// ============================================================================
// Diagnostics
// ============================================================================

pub fn render_diagnostic(diag: &Diagnostic) -> Vec<String> {
    let label = match diag.severity {
        Severity::Error => "Error:".red().bold(),
        Severity::Warning => "Warning:".yellow().bold(),
    };
    let mut lines = vec![format!("{label} {}", diag.summary)];
    if let Some(subject) = &diag.subject {
        lines.push(format!("  {} {subject}", "on".dimmed()));
    }
    if !diag.detail.is_empty() {
        lines.extend(diag.detail.lines().map(|l| format!("  {l}")));
    }
    lines
}

/// Print warnings, then errors
pub fn print_diagnostics(diags: &Diagnostics) {
    for diag in diags.warnings().chain(diags.errors()) {
        eprintln!();
        for line in render_diagnostic(diag) {
            eprintln!("{line}");
        }
    }
}

// ============================================================================
// Apply and state
// ============================================================================

pub fn render_summary(summary: &ApplySummary) -> String {
    let mut line = format!(
        "Resources: {} added, {} changed, {} replaced, {} destroyed",
        summary.created, summary.updated, summary.replaced, summary.deleted
    );
    if summary.read > 0 {
        line.push_str(&format!(", {} read", summary.read));
    }
    if summary.failed > 0 || summary.skipped > 0 {
        line.push_str(&format!(", {} failed, {} skipped", summary.failed, summary.skipped));
    }
    line.push('.');
    line
}

fn object_lines(title: &str, object: &ResourceInstanceObject) -> Vec<String> {
    let mut title = format!("# {}", title.bold());
    if object.is_tainted() {
        title.push_str(&format!(" {}", "(tainted)".red()));
    }
    let mut lines = vec![title];

    if let Some(attrs) = object.value.as_object() {
        let width = attrs.keys().map(String::len).max().unwrap_or(0);
        for (key, value) in attrs {
            let sensitive = object.sensitive_paths.covers(&Path::root().key(key.as_str()));
            lines.push(format!("    {key:<width$} = {}", format_value(value, sensitive)));
        }
    }
    lines.push(String::new());
    lines
}

/// Human-readable listing of every object and root output
pub fn render_state(state: &State) -> Vec<String> {
    let mut lines = Vec::new();
    for entry in state.instances() {
        let objects = entry
            .state
            .current
            .iter()
            .map(|obj| (entry.addr.to_string(), obj))
            .chain(
                entry
                    .state
                    .deposed
                    .iter()
                    .map(|(key, obj)| (format!("{} (deposed object {key})", entry.addr), obj)),
            );
        for (title, object) in objects {
            lines.extend(object_lines(&title, object));
        }
    }

    let outputs: Vec<_> = state.root_outputs().collect();
    if !outputs.is_empty() {
        lines.push("Outputs:".bold().to_string());
        for (name, output) in outputs {
            lines.push(format!("  {name} = {}", format_value(&output.value, output.sensitive)));
        }
    }
    lines
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use declarative::{
        AbsResourceInstance, Changes, DiagnosticKind, OutputAddr, OutputValue, PlanMode,
        ProviderConfigAddr, ReplaceOrder,
    };

    fn plain() {
        colored::control::set_override(false);
    }

    fn change(
        action: Action,
        before: Option<Value>,
        after: Option<Value>,
    ) -> ResourceInstanceChange {
        ResourceInstanceChange {
            addr: "local_value.a".parse::<AbsResourceInstance>().unwrap(),
            deposed: None,
            provider: ProviderConfigAddr::root("local"),
            action,
            reason: None,
            before,
            after,
            before_sensitive: PathSet::new(),
            after_sensitive: PathSet::new(),
            private: Vec::new(),
            requires_replace: Vec::new(),
        }
    }

    fn obj(pairs: &[(&str, Value)]) -> Value {
        Value::object(pairs.iter().cloned())
    }

    fn plan_of(resources: Vec<ResourceInstanceChange>) -> Plan {
        Plan {
            mode: PlanMode::Normal,
            changes: Changes {
                resources,
                outputs: Vec::new(),
            },
            prior_state: State::new(),
            prev_run_state: State::new(),
            targeted: false,
            diagnostics: Diagnostics::new(),
        }
    }

    #[test]
    fn test_create_lines_skip_nulls_and_show_unknowns() {
        plain();
        let c = change(
            Action::Create,
            None,
            Some(obj(&[
                ("id", Value::Unknown),
                ("triggers", Value::Null),
                ("value", Value::from("hi")),
            ])),
        );
        assert_eq!(change_title(&c), "+ local_value.a will be created");
        assert_eq!(
            attribute_lines(&c),
            ["+ id = (known after apply)", "+ value = \"hi\""]
        );
    }

    #[test]
    fn test_update_lines_hide_unchanged_and_mask_sensitive() {
        plain();
        let mut c = change(
            Action::Update,
            Some(obj(&[
                ("id", Value::from("x")),
                ("secret", Value::from("old")),
                ("value", Value::from("a")),
            ])),
            Some(obj(&[
                ("id", Value::from("x")),
                ("secret", Value::from("new")),
                ("value", Value::from("b")),
            ])),
        );
        c.before_sensitive = PathSet::from_iter([Path::root().key("secret")]);
        c.after_sensitive = c.before_sensitive.clone();

        assert_eq!(
            attribute_lines(&c),
            [
                "~ secret = (sensitive value) -> (sensitive value)",
                "~ value = \"a\" -> \"b\"",
                "# (1 unchanged attribute hidden)",
            ]
        );
    }

    #[test]
    fn test_replace_marks_forcing_attribute() {
        plain();
        let mut c = change(
            Action::Replace(ReplaceOrder::DeleteThenCreate),
            Some(obj(&[("id", Value::from("x")), ("triggers", Value::from("1"))])),
            Some(obj(&[("id", Value::Unknown), ("triggers", Value::from("2"))])),
        );
        c.reason = Some(ChangeReason::RequiresReplace);
        c.requires_replace = vec![Path::root().key("triggers")];

        assert_eq!(
            change_title(&c),
            "-/+ local_value.a must be replaced (an attribute forces replacement)"
        );
        assert_eq!(
            attribute_lines(&c),
            [
                "~ id = \"x\" -> (known after apply)",
                "~ triggers = \"1\" -> \"2\" # forces replacement",
            ]
        );
    }

    #[test]
    fn test_multiline_strings_get_a_line_diff() {
        plain();
        let c = change(
            Action::Update,
            Some(obj(&[("value", Value::from("a\nb\n"))])),
            Some(obj(&[("value", Value::from("a\nc\n"))])),
        );
        let lines = attribute_lines(&c);
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[1], "    - b");
        assert_eq!(lines[2], "    + c");
    }

    #[test]
    fn test_plan_footer_counts_replacements_twice() {
        plain();
        let plan = plan_of(vec![
            change(Action::Create, None, Some(obj(&[]))),
            change(
                Action::Replace(ReplaceOrder::CreateThenDelete),
                Some(obj(&[])),
                Some(obj(&[])),
            ),
            change(Action::NoOp, Some(obj(&[])), Some(obj(&[]))),
        ]);
        assert_eq!(plan_counts(&plan), (2, 0, 1));
        assert_eq!(
            render_plan(&plan).last().unwrap(),
            "Plan: 2 to add, 0 to change, 1 to destroy."
        );
    }

    #[test]
    fn test_diagnostic_rendering() {
        plain();
        let diag = Diagnostic::error(
            DiagnosticKind::PostconditionFailure,
            "Resource postcondition failed",
            "Output must not be blank.",
        )
        .with_subject("local_value.a");
        assert_eq!(
            render_diagnostic(&diag),
            [
                "Error: Resource postcondition failed",
                "  on local_value.a",
                "  Output must not be blank.",
            ]
        );
    }

    #[test]
    fn test_summary_line() {
        let summary = ApplySummary {
            created: 2,
            deleted: 1,
            failed: 1,
            skipped: 3,
            ..ApplySummary::default()
        };
        assert_eq!(
            render_summary(&summary),
            "Resources: 2 added, 0 changed, 0 replaced, 1 destroyed, 1 failed, 3 skipped."
        );
    }

    #[test]
    fn test_state_listing_masks_sensitive_values() {
        plain();
        let mut state = State::new();
        state.set_current(
            &"local_value.a".parse().unwrap(),
            ResourceInstanceObject::new(obj(&[
                ("id", Value::from("abc")),
                ("sensitive_value", Value::from("hunter2")),
            ]))
            .with_sensitive_paths(PathSet::from_iter([Path::root().key("sensitive_value")])),
            &ProviderConfigAddr::root("local"),
        );
        state.set_output(
            &OutputAddr::root("token"),
            OutputValue {
                value: Value::from("t"),
                sensitive: true,
            },
        );

        let lines = render_state(&state);
        assert_eq!(lines[0], "# local_value.a");
        assert_eq!(lines[1], "    id              = \"abc\"");
        assert_eq!(lines[2], "    sensitive_value = (sensitive value)");
        assert!(lines.contains(&"  token = (sensitive value)".to_string()));
        assert!(!lines.iter().any(|l| l.contains("hunter2")));
    }
}
