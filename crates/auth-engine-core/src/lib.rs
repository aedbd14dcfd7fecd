// Copyright (c) 2025 Authforge Contributors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! `auth-engine-core`: the data-access port, credential hasher, token codec,
//! session service, cleanup scheduler, plugin runtime, and the `Engine`
//! facade that wires them together.
//!
//! This crate has no opinion on HTTP, storage engine choice beyond the
//! bundled SQLite reference port, or which identity plugins are loaded —
//! those live in the `auth-engine-plugin-*` crates and a host binary that
//! assembles an [`Engine`] via [`EngineBuilder`].

pub mod cleanup;
pub mod data_access;
pub mod engine;
pub mod hasher;
pub mod plugin;
pub mod session;
pub mod token;

pub use cleanup::{CleanupReport, CleanupRunner, CleanupScheduler, HealthState, PluginConfig};
pub use data_access::{DataAccessPort, Op, Predicate, Record, SqliteDataAccessPort};
pub use engine::{Engine, EngineBuilder};
pub use hasher::{CredentialHasher, NoopPwnedLookup, PwnedLookup};
pub use plugin::{ConfigError, FieldViolation, HttpProtocol, Plugin, RootHooks, Step, StepContext, StepOutput};
pub use session::{PublicSubject, SessionCheck, SessionResolver, SessionService, Subject, SubjectKind};
pub use token::{hash_token, Claims, JwksKeyring, Token, TokenCodec, TokenKind};

pub use auth_engine_errors::EngineError;
