//! Typed views over container and image labels
//!
//! Container labels are the only durable record of what sail built. Reads and
//! writes go through [`ContainerState`] so the key names live in one place.

use crate::errors::{LabelError, MountError, Result};
use std::collections::HashMap;

/// Namespace prefix for every sail label; also the bare marker label key
pub const PREFIX: &str = "com.coder.sail";

pub const BASE_IMAGE: &str = "com.coder.sail.base_image";
pub const HAT: &str = "com.coder.sail.hat";
pub const PROJECT_LOCAL_DIR: &str = "com.coder.sail.project_local_dir";
pub const PROJECT_DIR: &str = "com.coder.sail.project_dir";
pub const PROJECT_NAME: &str = "com.coder.sail.project_name";
pub const PROXY_URL: &str = "com.coder.sail.proxy_url";

const SHARE_PREFIX: &str = "share.";
const PROJECT_ROOT: &str = "project_root";
const ON_START: &str = "on_start";

/// Label set attached to containers and images
pub type Labels = HashMap<String, String>;

/// State recorded on a sail container at creation time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerState {
    pub base_image: String,
    pub hat: Option<String>,
    pub project_local_dir: String,
    pub project_dir: String,
    pub project_name: String,
    pub proxy_url: String,
}

impl ContainerState {
    /// Encode into labels, including the bare marker label.
    pub fn to_labels(&self) -> Labels {
        let mut labels = Labels::new();
        labels.insert(PREFIX.to_string(), String::new());
        labels.insert(BASE_IMAGE.to_string(), self.base_image.clone());
        labels.insert(HAT.to_string(), self.hat.clone().unwrap_or_default());
        labels.insert(
            PROJECT_LOCAL_DIR.to_string(),
            self.project_local_dir.clone(),
        );
        labels.insert(PROJECT_DIR.to_string(), self.project_dir.clone());
        labels.insert(PROJECT_NAME.to_string(), self.project_name.clone());
        labels.insert(PROXY_URL.to_string(), self.proxy_url.clone());
        labels
    }

    /// Decode from a container's labels. Every key must be present; the
    /// hat label may be empty, meaning no hat.
    pub fn from_labels(container: &str, labels: &Labels) -> Result<Self> {
        let get = |key: &str| -> Result<String> {
            labels.get(key).cloned().ok_or_else(|| {
                LabelError::Missing {
                    container: container.to_string(),
                    label: key.to_string(),
                }
                .into()
            })
        };
        let hat = get(HAT)?;
        Ok(Self {
            base_image: get(BASE_IMAGE)?,
            hat: if hat.is_empty() { None } else { Some(hat) },
            project_local_dir: get(PROJECT_LOCAL_DIR)?,
            project_dir: get(PROJECT_DIR)?,
            project_name: get(PROJECT_NAME)?,
            proxy_url: get(PROXY_URL)?,
        })
    }
}

/// Label marking sail containers, in `docker ps --filter label=` form
pub fn marker_filter() -> String {
    PREFIX.to_string()
}

/// Image-declared bind mount from `share.<name>=<src>:<dst>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Share {
    pub source: String,
    pub target: String,
}

/// Read-only view over an image's labels
#[derive(Debug, Clone, Copy)]
pub struct ImageLabels<'a> {
    labels: &'a Labels,
}

impl<'a> ImageLabels<'a> {
    pub fn new(labels: &'a Labels) -> Self {
        Self { labels }
    }

    /// Shares ordered by label key
    pub fn shares(&self) -> Result<Vec<Share>> {
        let mut keys: Vec<&String> = self
            .labels
            .keys()
            .filter(|k| k.starts_with(SHARE_PREFIX))
            .collect();
        keys.sort();

        let mut shares = Vec::with_capacity(keys.len());
        for key in keys {
            let value = &self.labels[key];
            let tokens: Vec<&str> = value.split(':').collect();
            if tokens.len() != 2 {
                return Err(MountError::InvalidShare {
                    value: value.clone(),
                }
                .into());
            }
            shares.push(Share {
                source: tokens[0].to_string(),
                target: tokens[1].to_string(),
            });
        }
        Ok(shares)
    }

    /// Guest directory projects live under, when overridden by the image
    pub fn project_root(&self) -> Option<&'a str> {
        self.labels
            .get(PROJECT_ROOT)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    /// Command to run detached after the container starts
    pub fn on_start(&self) -> Option<&'a str> {
        self.labels
            .get(ON_START)
            .map(String::as_str)
            .filter(|v| !v.trim().is_empty())
    }

    /// Labels under the sail prefix, copied onto containers built from the image
    pub fn passthrough(&self) -> Labels {
        self.labels
            .iter()
            .filter(|(k, _)| k.starts_with(PREFIX))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> ContainerState {
        ContainerState {
            base_image: "codercom/ubuntu-dev".to_string(),
            hat: Some("/home/u/hats/go".to_string()),
            project_local_dir: "/home/u/Projects/cdr/sail".to_string(),
            project_dir: "/home/user/sail".to_string(),
            project_name: "sail".to_string(),
            proxy_url: "http://127.0.0.1:40123".to_string(),
        }
    }

    #[test]
    fn test_round_trip() {
        let original = state();
        let labels = original.to_labels();
        assert_eq!(labels.get(PREFIX), Some(&String::new()));
        let decoded = ContainerState::from_labels("cdr_sail", &labels).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_empty_hat_round_trips_to_none() {
        let original = ContainerState {
            hat: None,
            ..state()
        };
        let labels = original.to_labels();
        assert_eq!(labels.get(HAT), Some(&String::new()));
        assert_eq!(
            ContainerState::from_labels("c", &labels).unwrap().hat,
            None
        );
    }

    #[test]
    fn test_missing_label_is_reported_by_key() {
        let mut labels = state().to_labels();
        labels.remove(PROJECT_DIR);
        let err = ContainerState::from_labels("cdr_sail", &labels).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Label error: Container cdr_sail is missing label com.coder.sail.project_dir"
        );
    }

    #[test]
    fn test_shares_sorted_and_validated() {
        let mut labels = Labels::new();
        labels.insert("share.b".to_string(), "~/b:/b".to_string());
        labels.insert("share.a".to_string(), "~/.gitconfig:~/.gitconfig".to_string());
        labels.insert("unrelated".to_string(), "x".to_string());
        let shares = ImageLabels::new(&labels).shares().unwrap();
        assert_eq!(
            shares,
            vec![
                Share {
                    source: "~/.gitconfig".to_string(),
                    target: "~/.gitconfig".to_string()
                },
                Share {
                    source: "~/b".to_string(),
                    target: "/b".to_string()
                },
            ]
        );

        labels.insert("share.c".to_string(), "a:b:c".to_string());
        assert!(ImageLabels::new(&labels).shares().is_err());
    }

    #[test]
    fn test_image_hooks_and_passthrough() {
        let mut labels = Labels::new();
        labels.insert("project_root".to_string(), "/src".to_string());
        labels.insert("on_start".to_string(), "make dev".to_string());
        labels.insert("com.coder.sail.hat_note".to_string(), "go".to_string());
        labels.insert("maintainer".to_string(), "x".to_string());
        let view = ImageLabels::new(&labels);
        assert_eq!(view.project_root(), Some("/src"));
        assert_eq!(view.on_start(), Some("make dev"));
        let passthrough = view.passthrough();
        assert_eq!(passthrough.len(), 1);
        assert!(passthrough.contains_key("com.coder.sail.hat_note"));
    }
}
