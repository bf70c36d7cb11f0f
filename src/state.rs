//! Persisted open-position cache: a multiset of tickers, one occurrence per open leg.
//!
//! Advisory only. The server's position report is the truth and corrects it on
//! every ticker selection.

use serde::{Deserialize, Serialize};
use std::{fs, path::Path};
use tracing::warn;

use crate::utils::sanitize_ticker;

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenPositionSet {
    /// One entry per open leg; a ticker with both legs open appears twice.
    tickers: Vec<String>,
}

impl OpenPositionSet {
    pub fn load(path: &Path) -> Self {
        if path.exists() {
            match fs::read_to_string(path) {
                Ok(s) => match serde_json::from_str::<Self>(&s) {
                    Ok(me) => return me.normalized(),
                    Err(e) => warn!("open-position cache unreadable, starting empty: {}", e),
                },
                Err(e) => warn!("open-position cache read failed: {}", e),
            }
        }
        Self::default()
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let s = serde_json::to_string_pretty(self)?;
        fs::write(path, s)?;
        Ok(())
    }

    fn normalized(mut self) -> Self {
        self.tickers = self
            .tickers
            .iter()
            .map(|t| sanitize_ticker(t))
            .filter(|t| !t.is_empty())
            .collect();
        self
    }

    pub fn count(&self, ticker: &str) -> usize {
        let tk = sanitize_ticker(ticker);
        self.tickers.iter().filter(|t| **t == tk).count()
    }

    pub fn add(&mut self, ticker: &str) {
        self.tickers.push(sanitize_ticker(ticker));
    }

    /// Remove one occurrence. Returns false when the ticker was absent.
    pub fn remove_one(&mut self, ticker: &str) -> bool {
        let tk = sanitize_ticker(ticker);
        match self.tickers.iter().position(|t| *t == tk) {
            Some(i) => {
                self.tickers.remove(i);
                true
            }
            None => false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tickers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tickers.len()
    }
}
