//! # Support Bot
//!
//! A retrieval-augmented support bot for a DeFi protocol.
//!
//! Scrapers collect the protocol's documentation, live app pages and blog
//! posts; the indexer chunks them into a SQLite collection with FTS5 and
//! optional embeddings; the RAG agent answers questions from that
//! collection through Anthropic or OpenAI chat models. The same agent is
//! served to Telegram, Discord and Slack bots and to an HTTP API used by a
//! web chat and an admin dashboard.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌─────────────┐   ┌───────────┐
//! │  Scrapers   │──▶│   Indexer   │──▶│  SQLite   │
//! │ docs/web/blog│  │ Chunk+Embed │   │ FTS5+Vec  │
//! └─────────────┘   └─────────────┘   └─────┬─────┘
//!        ▲                                  │
//!        │ scheduler                 ┌──────┴──────┐
//!                                    ▼             ▼
//!                              ┌──────────┐  ┌───────────┐
//!                              │ RAG agent│◀─│ HTTP API  │
//!                              └────┬─────┘  └───────────┘
//!                                   │
//!                    ┌──────────────┼──────────────┐
//!                    ▼              ▼              ▼
//!               Telegram         Discord         Slack
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! sbot init                      # create database
//! sbot scrape all                # scrape every source and build the index
//! sbot ask "What are Autopools?"
//! sbot serve                     # API, bot manager and scraper service
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration and environment secrets |
//! | [`db`] / [`migrate`] | Database connection and schema |
//! | [`models`] | Core data types |
//! | [`scrape`] / [`extract`] | Scrapers and HTML extraction |
//! | [`chunk`] | Text chunking |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`index`] | Collection builds and verification |
//! | [`search`] | Source-prioritised retrieval |
//! | [`llm`] / [`prompts`] / [`rag`] | Chat models, system prompts, answering |
//! | [`conversation`] | In-memory conversation memory |
//! | [`storage`] / [`bot_config`] | Persistent conversations and bot records |
//! | [`bots`] | Bot manager and platform adapters |
//! | [`scheduler`] | Background scraper service |
//! | [`server`] | HTTP API |
//! | [`stats`] / [`export`] | Reports and exports |

pub mod bot_config;
pub mod bots;
pub mod chunk;
pub mod config;
pub mod conversation;
pub mod db;
pub mod embedding;
pub mod export;
pub mod extract;
pub mod index;
pub mod llm;
pub mod migrate;
pub mod models;
pub mod prompts;
pub mod rag;
pub mod scheduler;
pub mod scrape;
pub mod search;
pub mod server;
pub mod stats;
pub mod storage;
