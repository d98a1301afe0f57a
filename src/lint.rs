//! Lint findings: recipe scoping, verdicts, and comment formatting.
//!
//! The runner's global `lint_error` flag is advisory only. The
//! authoritative decision re-derives which recipes are actually in scope
//! for the live PR and looks at those recipes' error flags alone; a
//! broken recipe that the PR never touched must not fail the PR.

use std::collections::BTreeSet;

use textwrap::dedent;

use crate::api::StatusState;
use crate::task::{ErrorMap, FindingsMap};

/// Hidden marker identifying the lint bot's comment for idempotent upserts.
pub const LINT_COMMENT_MARKER: &str = "<!-- stoker:lint -->";

/// Overall lint verdict for a PR.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LintVerdict {
    /// No findings at all.
    Good,
    /// Hints only.
    Mixed,
    /// At least one lint.
    Bad,
}

impl LintVerdict {
    pub fn status(&self) -> StatusState {
        match self {
            LintVerdict::Good | LintVerdict::Mixed => StatusState::Success,
            LintVerdict::Bad => StatusState::Failure,
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            LintVerdict::Good => "all recipes are in excellent condition",
            LintVerdict::Mixed => "some recipes have hints",
            LintVerdict::Bad => "some recipes need changes",
        }
    }
}

/// Which recipes from the findings maps does this PR actually touch?
///
/// A findings key names a recipe directory; it is in scope when some
/// changed file lives in it (or is it). Findings for untouched recipes
/// are reported by the tool but never decide the PR's fate.
pub fn recipes_for_linting(
    changed_files: &[String],
    lints: &FindingsMap,
    hints: &FindingsMap,
) -> BTreeSet<String> {
    lints
        .keys()
        .chain(hints.keys())
        .filter(|recipe| {
            changed_files.iter().any(|file| {
                file == *recipe || file.starts_with(&format!("{recipe}/"))
            })
        })
        .cloned()
        .collect()
}

/// Did any in-scope recipe error? A recipe missing from the error map
/// counts as errored: absence of evidence is not evidence of success.
pub fn scoped_lint_error(errors: &ErrorMap, scope: &BTreeSet<String>) -> bool {
    scope
        .iter()
        .any(|recipe| errors.get(recipe).copied().unwrap_or(true))
}

fn findings_section(header: &str, recipe: &str, messages: &[String]) -> String {
    let mut section = format!("{header} recipe `{recipe}`:\n\n");
    for message in messages {
        section.push_str(&format!(" - {message}\n"));
    }
    section
}

fn comment_footer(run_link: Option<&str>) -> String {
    let mut footer = String::new();
    if let Some(link) = run_link {
        footer.push_str(&format!(
            "\n<sub>This message was generated by workflow run [{link}]({link}). \
             Examine the logs at this URL for more detail.</sub>\n"
        ));
    }
    footer.push_str(LINT_COMMENT_MARKER);
    footer.push('\n');
    footer
}

/// Build the findings comment for the in-scope recipes and derive the
/// overall verdict.
pub fn build_findings_comment(
    lints: &FindingsMap,
    hints: &FindingsMap,
    scope: &BTreeSet<String>,
    run_link: Option<&str>,
) -> (String, LintVerdict) {
    let mut lint_sections = Vec::new();
    let mut hint_sections = Vec::new();

    for recipe in scope {
        if let Some(messages) = lints.get(recipe).filter(|m| !m.is_empty()) {
            lint_sections.push(findings_section("For", recipe, messages));
        }
        if let Some(messages) = hints.get(recipe).filter(|m| !m.is_empty()) {
            hint_sections.push(findings_section("For", recipe, messages));
        }
    }

    let verdict = if !lint_sections.is_empty() {
        LintVerdict::Bad
    } else if !hint_sections.is_empty() {
        LintVerdict::Mixed
    } else {
        LintVerdict::Good
    };

    let mut body = String::from(
        "Hi! This is the friendly automated feedstock linting service.\n\n",
    );
    match verdict {
        LintVerdict::Good => {
            body.push_str(
                "I just wanted to let you know that I linted all the recipes in \
                 your PR and found everything in excellent condition.\n",
            );
        }
        LintVerdict::Mixed => {
            body.push_str(
                "I just wanted to let you know that I linted all the recipes in \
                 your PR and found everything in good shape. I do have some \
                 suggestions for making things even better though:\n\n",
            );
            for section in &hint_sections {
                body.push_str(section);
                body.push('\n');
            }
        }
        LintVerdict::Bad => {
            body.push_str(
                "I wanted to let you know that I linted all the recipes in your \
                 PR and found some issues that need to be fixed:\n\n",
            );
            for section in &lint_sections {
                body.push_str(section);
                body.push('\n');
            }
            if !hint_sections.is_empty() {
                body.push_str("I also have some suggestions:\n\n");
                for section in &hint_sections {
                    body.push_str(section);
                    body.push('\n');
                }
            }
        }
    }

    body.push_str(&comment_footer(run_link));
    (body, verdict)
}

/// Fixed comment posted when the lint tool itself fell over.
pub fn lint_failure_comment(run_link: Option<&str>) -> String {
    let mut body = dedent(
        "
        Hi! This is the friendly automated feedstock linting service.

        I failed to even lint the recipe, probably because of a bug in the
        linting tool :cry:. This likely still indicates a problem in your
        recipe though. You can lint it locally with the feedstock tooling
        to get a traceback that shows what is going on.
        ",
    )
    .trim_start()
    .to_string();
    body.push_str(&comment_footer(run_link));
    body
}
