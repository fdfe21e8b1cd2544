//! Module that wires mailboxes, spawns every actor and observes them.

use crate::{
    central_manager::{CentralManager, CmReport},
    config::Config,
    error::DsmError,
    fault::FaultPlan,
    log,
    network::Directory,
    processor::{Processor, ProcessorReport},
};
use color_print::cformat;
use futures::future::join_all;
use tokio::{sync::watch, task::JoinHandle};
use tokio_util::sync::CancellationToken;

/// CM that starts as the primary.
pub const INITIAL_PRIMARY: usize = 0;

pub struct Cluster {
    handles: Vec<JoinHandle<()>>,
    shutdown: CancellationToken,
    cm_reports: Vec<watch::Receiver<CmReport>>,
    processor_reports: Vec<watch::Receiver<ProcessorReport>>,
}

impl Cluster {
    /// Function that spawns every central manager and processor described by `config`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(config: &Config) -> Result<Self, DsmError> {
        config.validate()?;

        let (directory, processor_mailboxes, cm_mailboxes) = Directory::new(
            config.processors,
            config.central_managers,
            config.mailbox_capacity(),
        );
        let shutdown = CancellationToken::new();
        let mut handles = Vec::with_capacity(config.processors + config.central_managers);

        let mut cm_reports = Vec::with_capacity(config.central_managers);
        for (id, mailboxes) in cm_mailboxes.into_iter().enumerate() {
            let central_manager = CentralManager::new(
                id,
                id == INITIAL_PRIMARY,
                directory.clone(),
                FaultPlan::for_central_manager(id, &config.faults),
            )
            .with_known_primary(INITIAL_PRIMARY);
            let (report_tx, report_rx) = watch::channel(central_manager.report());
            cm_reports.push(report_rx);
            handles.push(tokio::spawn(central_manager.run(
                mailboxes,
                report_tx,
                shutdown.clone(),
            )));
        }

        let mut processor_reports = Vec::with_capacity(config.processors);
        for (id, mailbox) in processor_mailboxes.into_iter().enumerate() {
            let processor = Processor::new(id, INITIAL_PRIMARY, config, directory.clone());
            let (report_tx, report_rx) = watch::channel(processor.report());
            processor_reports.push(report_rx);
            handles.push(tokio::spawn(processor.run(mailbox, report_tx, shutdown.clone())));
        }

        log::info(&cformat!(
            "Started <bold>{}</bold> central managers and <bold>{}</bold> processors over <bold>{}</bold> pages.",
            config.central_managers,
            config.processors,
            config.pages
        ));

        Ok(Self {
            handles,
            shutdown,
            cm_reports,
            processor_reports,
        })
    }

    pub fn cm_reports(&self) -> Vec<CmReport> {
        self.cm_reports
            .iter()
            .map(|report| report.borrow().clone())
            .collect()
    }

    pub fn processor_reports(&self) -> Vec<ProcessorReport> {
        self.processor_reports
            .iter()
            .map(|report| report.borrow().clone())
            .collect()
    }

    /// Function that returns the primary if exactly one live CM claims the role.
    pub fn primary(&self) -> Option<usize> {
        let primaries: Vec<usize> = self
            .cm_reports()
            .iter()
            .filter(|report| report.is_alive && report.is_primary)
            .map(|report| report.id)
            .collect();
        match primaries.as_slice() {
            [primary] => Some(*primary),
            _ => None,
        }
    }

    /// Function that returns the primary once every processor follows it and no election runs.
    pub fn converged_primary(&self) -> Option<usize> {
        let primary = self.primary()?;
        self.processor_reports()
            .iter()
            .all(|report| report.primary == primary && !report.in_election)
            .then_some(primary)
    }

    /// Function that returns a one-line status of the cluster.
    pub fn summary(&self) -> String {
        let cms = self.cm_reports();
        let alive = cms.iter().filter(|report| report.is_alive).count();
        let in_election = self
            .processor_reports()
            .iter()
            .filter(|report| report.in_election)
            .count();
        match self.primary() {
            Some(primary) => {
                let owned = cms[primary].state.entries.len();
                cformat!(
                    "Primary <bold>CM {}</bold>, {}/{} CMs alive, {} pages written, {} processors in election.",
                    primary,
                    alive,
                    cms.len(),
                    owned,
                    in_election
                )
            }
            None => cformat!(
                "<yellow>No primary</yellow>, {}/{} CMs alive, {} processors in election.",
                alive,
                cms.len(),
                in_election
            ),
        }
    }

    /// Function that stops every actor and waits for them.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        for result in join_all(self.handles).await {
            if let Err(e) = result {
                log::error(&format!("Actor task failed: {e}"));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn invalid_config_does_not_start() {
        let config = Config {
            central_managers: 0,
            ..Config::default()
        };
        assert!(matches!(Cluster::start(&config), Err(DsmError::Config(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn starts_with_the_initial_primary() {
        let config = Config {
            processors: 2,
            central_managers: 2,
            faults: Vec::new(),
            ..Config::default()
        };
        let cluster = Cluster::start(&config).unwrap();
        assert_eq!(cluster.converged_primary(), Some(INITIAL_PRIMARY));
        assert!(cluster.summary().contains("CM 0"));
        cluster.shutdown().await;
    }
}
