//! Progress display driven by engine hooks

use colored::Colorize;
use declarative::{
    AbsResourceInstance, Action, DeposedKey, Hook, HookAction, NodeKind, ResourceInstanceChange,
};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::time::Duration;

/// Shows one bar for a plan or apply walk
pub struct ProgressHook {
    bar: ProgressBar,
}

impl ProgressHook {
    /// Spinner for planning, where the node count is not known up front
    pub fn planning(quiet: bool) -> Self {
        let bar = if quiet {
            ProgressBar::hidden()
        } else {
            ProgressBar::new_spinner()
        };
        if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.green} {msg}") {
            bar.set_style(style);
        }
        bar.enable_steady_tick(Duration::from_millis(100));
        Self { bar }
    }

    /// Bar counting applied changes
    pub fn applying(total: usize, quiet: bool) -> Self {
        let bar = ProgressBar::new(total as u64);
        if quiet {
            bar.set_draw_target(ProgressDrawTarget::hidden());
        }
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
        {
            bar.set_style(style.progress_chars("=>-"));
        }
        Self { bar }
    }

    pub fn finish(&self) {
        self.bar.finish_and_clear();
    }

    fn line(&self, msg: String) {
        self.bar.suspend(|| println!("{msg}"));
    }
}

fn object_label(addr: &AbsResourceInstance, deposed: Option<&DeposedKey>) -> String {
    match deposed {
        Some(key) => format!("{addr} (deposed {key})"),
        None => addr.to_string(),
    }
}

impl Hook for ProgressHook {
    fn pre_refresh(&self, addr: &AbsResourceInstance, deposed: Option<&DeposedKey>) -> HookAction {
        self.bar
            .set_message(format!("Refreshing {}", object_label(addr, deposed)));
        HookAction::Continue
    }

    fn pre_diff(&self, addr: &AbsResourceInstance, deposed: Option<&DeposedKey>) -> HookAction {
        self.bar
            .set_message(format!("Planning {}", object_label(addr, deposed)));
        HookAction::Continue
    }

    fn post_diff(&self, _change: &ResourceInstanceChange) -> HookAction {
        self.bar.tick();
        HookAction::Continue
    }

    fn pre_apply(
        &self,
        addr: &AbsResourceInstance,
        deposed: Option<&DeposedKey>,
        action: Action,
    ) -> HookAction {
        let verb = match action {
            Action::Create => "Creating",
            Action::Update => "Updating",
            Action::Delete => "Destroying",
            Action::Replace(_) => "Replacing",
            Action::Read => "Reading",
            Action::NoOp => return HookAction::Continue,
        };
        self.bar
            .set_message(format!("{verb} {}", object_label(addr, deposed)));
        HookAction::Continue
    }

    fn post_apply(
        &self,
        addr: &AbsResourceInstance,
        deposed: Option<&DeposedKey>,
        error: Option<&str>,
    ) -> HookAction {
        let label = object_label(addr, deposed);
        match error {
            Some(err) => self.line(format!("  {} {label}: {err}", "✗".red())),
            None => self.line(format!("  {} {label}", "✓".green())),
        }
        self.bar.inc(1);
        HookAction::Continue
    }

    fn node_skipped(&self, node: &NodeKind, reason: &str) {
        if let NodeKind::Resource(_) = node {
            self.line(format!("  {} {node} skipped: {reason}", "⚠".yellow()));
            self.bar.inc(1);
        }
    }
}
