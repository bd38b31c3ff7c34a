// ABOUTME: Library crate for clustercast exposing the transport and configuration API

#![allow(missing_docs)]

pub mod config;
pub mod transport;
