use anyhow::Context;
use serde::{Deserialize, Serialize};

pub const DEFAULT_API_URL: &str = "https://api.github.com";
const USER_AGENT: &str = "fleet";

/// The authenticated GitHub account (subset of fields).
#[derive(Debug, Serialize, Deserialize)]
pub struct GitHubUser {
    pub login: String,
    pub name: Option<String>,
}

/// A GitHub repository (subset of fields we care about).
#[derive(Debug, Serialize, Deserialize)]
pub struct GitHubRepo {
    pub full_name: String,
    pub name: String,
    pub private: bool,
    pub html_url: String,
    pub description: Option<String>,
    pub default_branch: String,
}

/// Known GitHub token prefixes.
const GITHUB_TOKEN_PREFIXES: &[&str] = &[
    "ghp_",        // Personal access tokens (classic)
    "github_pat_", // Fine-grained personal access tokens
    "gho_",        // OAuth access tokens
    "ghu_",        // GitHub App user-to-server tokens
    "ghs_",        // GitHub App server-to-server tokens
    "ghr_",        // GitHub App refresh tokens
];

/// Format check only; says nothing about whether the token is live.
pub fn is_valid_github_token(token: &str) -> bool {
    GITHUB_TOKEN_PREFIXES
        .iter()
        .any(|prefix| token.starts_with(prefix))
}

/// Thin GitHub REST client used to validate a connected token.
#[derive(Clone)]
pub struct GitHubClient {
    http: reqwest::Client,
    api_url: String,
}

impl GitHubClient {
    pub fn new(api_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_url: api_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Resolve the account behind `token`. Fails if GitHub rejects it.
    pub async fn authenticated_user(&self, token: &str) -> anyhow::Result<GitHubUser> {
        self.http
            .get(format!("{}/user", self.api_url))
            .header("Authorization", format!("Bearer {}", token))
            .header("User-Agent", USER_AGENT)
            .send()
            .await
            .context("Failed to send user request to GitHub")?
            .error_for_status()
            .context("GitHub user API returned error status")?
            .json::<GitHubUser>()
            .await
            .context("Failed to parse user response from GitHub")
    }

    /// List repos accessible to the authenticated user, most recently updated first.
    pub async fn list_repos(
        &self,
        token: &str,
        page: u32,
        per_page: u32,
    ) -> anyhow::Result<Vec<GitHubRepo>> {
        self.http
            .get(format!("{}/user/repos", self.api_url))
            .header("Authorization", format!("Bearer {}", token))
            .header("User-Agent", USER_AGENT)
            .query(&[
                ("sort", "updated".to_string()),
                ("per_page", per_page.to_string()),
                ("page", page.to_string()),
            ])
            .send()
            .await
            .context("Failed to send repos request to GitHub")?
            .error_for_status()
            .context("GitHub repos API returned error status")?
            .json::<Vec<GitHubRepo>>()
            .await
            .context("Failed to parse repos response from GitHub")
    }
}
