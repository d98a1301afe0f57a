//! Runtime configuration for stoker.
//!
//! Everything comes from the environment (optionally seeded from a
//! `.env` file): stoker runs as a batch job inside CI, so there is no
//! config file discovery. Values are captured once at startup; accessors
//! for conditionally-required values fail with the variable name so a
//! misconfigured job dies with an actionable message.

use anyhow::{Context, Result};

pub const ENV_CONTAINER_NAME: &str = "STOKER_CONTAINER_NAME";
pub const ENV_CONTAINER_TAG: &str = "STOKER_CONTAINER_TAG";
pub const ENV_FORGE_ORG: &str = "STOKER_FORGE_ORG";
pub const ENV_FORGE_URL: &str = "STOKER_FORGE_URL";
pub const ENV_API_ROOT: &str = "STOKER_API_ROOT";
pub const ENV_TOKEN: &str = "STOKER_TOKEN";
pub const ENV_ADMIN_TOKEN: &str = "STOKER_ADMIN_TOKEN";
pub const ENV_BOT_USER: &str = "STOKER_BOT_USER";

const DEFAULT_FORGE_URL: &str = "https://github.com";
const DEFAULT_API_ROOT: &str = "https://api.github.com";
const DEFAULT_BOT_USER: &str = "stoker-bot";

/// Runtime configuration captured from the environment at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub forge_url: String,
    pub api_root: String,
    pub bot_user: String,
    org: Option<String>,
    token: Option<String>,
    admin_token: Option<String>,
    container_name: Option<String>,
    container_tag: Option<String>,
    run_repo: Option<String>,
    run_id: Option<String>,
}

fn env_opt(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

impl Config {
    /// Capture configuration from the environment.
    pub fn from_env() -> Self {
        Self {
            forge_url: env_opt(ENV_FORGE_URL).unwrap_or_else(|| DEFAULT_FORGE_URL.to_string()),
            api_root: env_opt(ENV_API_ROOT).unwrap_or_else(|| DEFAULT_API_ROOT.to_string()),
            bot_user: env_opt(ENV_BOT_USER).unwrap_or_else(|| DEFAULT_BOT_USER.to_string()),
            org: env_opt(ENV_FORGE_ORG),
            token: env_opt(ENV_TOKEN),
            admin_token: env_opt(ENV_ADMIN_TOKEN),
            container_name: env_opt(ENV_CONTAINER_NAME),
            container_tag: env_opt(ENV_CONTAINER_TAG),
            run_repo: env_opt("GITHUB_REPOSITORY"),
            run_id: env_opt("GITHUB_RUN_ID"),
        }
    }

    /// The organization owning the feedstocks.
    pub fn org(&self) -> Result<&str> {
        self.org
            .as_deref()
            .with_context(|| format!("{ENV_FORGE_ORG} is not set"))
    }

    /// Token for the standard API session.
    pub fn token(&self) -> Result<&str> {
        self.token
            .as_deref()
            .with_context(|| format!("{ENV_TOKEN} is not set"))
    }

    /// Token for the elevated API session used by automerge.
    pub fn admin_token(&self) -> Result<&str> {
        self.admin_token
            .as_deref()
            .with_context(|| format!("{ENV_ADMIN_TOKEN} is not set"))
    }

    /// Fully qualified sandbox tool image (`name:tag`).
    pub fn container_image(&self) -> Result<String> {
        let name = self
            .container_name
            .as_deref()
            .with_context(|| format!("{ENV_CONTAINER_NAME} is not set"))?;
        let tag = self
            .container_tag
            .as_deref()
            .with_context(|| format!("{ENV_CONTAINER_TAG} is not set"))?;
        Ok(format!("{name}:{tag}"))
    }

    /// `org/repo` slug for a feedstock.
    pub fn full_repo(&self, repo: &str) -> Result<String> {
        Ok(format!("{}/{repo}", self.org()?))
    }

    /// Anonymous clone URL for a repository.
    pub fn clone_url(&self, owner: &str, repo: &str) -> String {
        format!("{}/{owner}/{repo}.git", self.forge_url)
    }

    /// Link to this CI run's logs, when running inside the CI runner.
    pub fn run_link(&self) -> Option<String> {
        match (&self.run_repo, &self.run_id) {
            (Some(repo), Some(id)) => {
                Some(format!("{}/{repo}/actions/runs/{id}", self.forge_url))
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blank() -> Config {
        Config {
            forge_url: DEFAULT_FORGE_URL.to_string(),
            api_root: DEFAULT_API_ROOT.to_string(),
            bot_user: DEFAULT_BOT_USER.to_string(),
            org: None,
            token: None,
            admin_token: None,
            container_name: None,
            container_tag: None,
            run_repo: None,
            run_id: None,
        }
    }

    #[test]
    fn test_missing_org_names_the_variable() {
        let err = blank().org().unwrap_err();
        assert!(err.to_string().contains(ENV_FORGE_ORG));
    }

    #[test]
    fn test_container_image_joins_name_and_tag() {
        let cfg = Config {
            container_name: Some("ghcr.io/acme/feedstock-ops".into()),
            container_tag: Some("v3".into()),
            ..blank()
        };
        assert_eq!(
            cfg.container_image().unwrap(),
            "ghcr.io/acme/feedstock-ops:v3"
        );
    }

    #[test]
    fn test_clone_url_and_full_repo() {
        let cfg = Config {
            org: Some("acme".into()),
            ..blank()
        };
        assert_eq!(cfg.full_repo("zlib-feedstock").unwrap(), "acme/zlib-feedstock");
        assert_eq!(
            cfg.clone_url("acme", "zlib-feedstock"),
            "https://github.com/acme/zlib-feedstock.git"
        );
    }

    #[test]
    fn test_run_link_requires_both_parts() {
        let mut cfg = blank();
        assert_eq!(cfg.run_link(), None);
        cfg.run_repo = Some("acme/stoker".into());
        assert_eq!(cfg.run_link(), None);
        cfg.run_id = Some("12345".into());
        assert_eq!(
            cfg.run_link().unwrap(),
            "https://github.com/acme/stoker/actions/runs/12345"
        );
    }
}
