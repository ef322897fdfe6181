//! Periodic connection statistics

use super::connection::AnswererPeer;
use crate::notice::{Notice, NoticeSink};
use crate::pipeline::instance::InstanceRef;
use crate::timer::TimerHandle;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;
use webrtc::stats::{StatsReport, StatsReportType};

/// One stats report, flattened to displayable fields
#[derive(Debug, Clone, PartialEq)]
pub struct StatsEntry {
    /// Report id
    pub id: String,
    /// Report type (`candidate-pair`, `data-channel`, ...)
    pub kind: String,
    /// `(name, value)` pairs
    pub fields: Vec<(String, String)>,
}

/// Where the pipeline instance behind a session can be inspected
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstanceLinks {
    /// Instance summary and status URLs
    Known {
        /// `{server}/pipelines/{id}`
        summary: String,
        /// `{server}/pipelines/status/{id}`
        status: String,
    },
    /// Instance id was never learned
    Unknown,
}

impl InstanceLinks {
    /// Links for `instance` on the server at `base_url`
    pub fn for_instance(base_url: &str, instance: &InstanceRef) -> Self {
        match instance {
            InstanceRef::Known(id) => {
                let base = base_url.trim_end_matches('/');
                InstanceLinks::Known {
                    summary: format!("{}/pipelines/{}", base, id),
                    status: format!("{}/pipelines/status/{}", base, id),
                }
            }
            InstanceRef::Unknown => InstanceLinks::Unknown,
        }
    }
}

/// One sample of every report the peer connection exposes
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StatsSample {
    /// Pipeline instance links, when the session belongs to a known instance
    pub instance: Option<InstanceLinks>,
    /// Reports in id order
    pub reports: Vec<StatsEntry>,
}

impl StatsSample {
    /// Flatten a webrtc-rs report
    pub fn from_report(report: &StatsReport) -> Self {
        let mut reports: Vec<StatsEntry> = report
            .reports
            .iter()
            .map(|(id, value)| entry_from(id, value))
            .collect();
        reports.sort_by(|a, b| a.id.cmp(&b.id));
        Self {
            instance: None,
            reports,
        }
    }

    /// Multi-line text rendering
    pub fn summary(&self) -> String {
        let mut out = String::new();
        match &self.instance {
            Some(InstanceLinks::Known { summary, status }) => {
                let _ = writeln!(out, "Pipeline Summary: {}", summary);
                let _ = writeln!(out, "Pipeline Status: {}", status);
            }
            Some(InstanceLinks::Unknown) => {
                let _ = writeln!(out, "Pipeline Server Instance ID UNKNOWN");
            }
            None => {}
        }
        for report in &self.reports {
            let _ = writeln!(out, "Report: {}", report.kind);
            let _ = writeln!(out, "  ID: {}", report.id);
            for (name, value) in &report.fields {
                let _ = writeln!(out, "  {}: {}", name, value);
            }
        }
        out
    }
}

fn field(name: &str, value: impl ToString) -> (String, String) {
    (name.to_string(), value.to_string())
}

fn entry_from(id: &str, value: &StatsReportType) -> StatsEntry {
    let (kind, fields) = match value {
        StatsReportType::CandidatePair(pair) => (
            "candidate-pair",
            vec![
                field("nominated", pair.nominated),
                field("localCandidateId", &pair.local_candidate_id),
                field("remoteCandidateId", &pair.remote_candidate_id),
                field("packetsSent", pair.packets_sent),
                field("packetsReceived", pair.packets_received),
                field("bytesSent", pair.bytes_sent),
                field("bytesReceived", pair.bytes_received),
                field("currentRoundTripTime", pair.current_round_trip_time),
            ],
        ),
        StatsReportType::DataChannel(channel) => (
            "data-channel",
            vec![
                field("label", &channel.label),
                field("messagesSent", channel.messages_sent),
                field("messagesReceived", channel.messages_received),
                field("bytesSent", channel.bytes_sent),
                field("bytesReceived", channel.bytes_received),
            ],
        ),
        StatsReportType::Transport(transport) => (
            "transport",
            vec![
                field("bytesSent", transport.bytes_sent),
                field("bytesReceived", transport.bytes_received),
            ],
        ),
        StatsReportType::InboundRTP(rtp) => (
            "inbound-rtp",
            vec![
                field("kind", &rtp.kind),
                field("packetsReceived", rtp.packets_received),
                field("bytesReceived", rtp.bytes_received),
            ],
        ),
        StatsReportType::OutboundRTP(rtp) => (
            "outbound-rtp",
            vec![field("kind", &rtp.kind), field("packetsSent", rtp.packets_sent)],
        ),
        StatsReportType::RemoteInboundRTP(rtp) => (
            "remote-inbound-rtp",
            vec![field("kind", &rtp.kind), field("packetsLost", rtp.packets_lost)],
        ),
        StatsReportType::RemoteOutboundRTP(_) => ("remote-outbound-rtp", Vec::new()),
        _ => ("other", Vec::new()),
    };

    StatsEntry {
        id: id.to_string(),
        kind: kind.to_string(),
        fields,
    }
}

/// Samples a peer connection until cancelled
pub struct StatsPoller;

impl StatsPoller {
    /// Start sampling: first sample after `initial_delay`, then every `interval`.
    ///
    /// Failed samples are logged and skipped. Dropping the returned handle
    /// stops the poller.
    pub fn spawn(
        peer: Arc<dyn AnswererPeer>,
        instance: Option<InstanceLinks>,
        initial_delay: Duration,
        interval: Duration,
        notices: NoticeSink,
    ) -> TimerHandle {
        let task = tokio::spawn(async move {
            tokio::time::sleep(initial_delay).await;
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                match peer.stats().await {
                    Ok(mut sample) => {
                        sample.instance = instance.clone();
                        notices.emit(Notice::Stats(sample));
                    }
                    Err(e) => warn!("Failed to sample connection stats: {}", e),
                }
            }
        });
        TimerHandle::from_task("stats", task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MediaConstraints;
    use crate::notice::notice_channel;
    use crate::peer::media::LocalMedia;
    use crate::signaling::protocol::{IceCandidate, SessionDescription};
    use crate::{Error, Result};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingPeer {
        calls: AtomicU32,
    }

    #[async_trait]
    impl AnswererPeer for CountingPeer {
        async fn set_remote_description(&self, _desc: SessionDescription) -> Result<()> {
            Ok(())
        }

        async fn create_answer(&self) -> Result<SessionDescription> {
            Ok(SessionDescription::answer("v=0"))
        }

        async fn add_ice_candidate(&self, _candidate: IceCandidate) -> Result<()> {
            Ok(())
        }

        async fn stats(&self) -> Result<StatsSample> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n == 1 {
                return Err(Error::PeerConnectionError("stats unavailable".to_string()));
            }
            Ok(StatsSample {
                instance: None,
                reports: vec![StatsEntry {
                    id: format!("pair-{}", n),
                    kind: "candidate-pair".to_string(),
                    fields: vec![],
                }],
            })
        }

        async fn add_local_media(&self, _constraints: MediaConstraints) -> Result<LocalMedia> {
            Ok(LocalMedia::default())
        }

        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_instance_links() {
        let links = InstanceLinks::for_instance(
            "http://localhost:8080/",
            &InstanceRef::Known("abc-1".to_string()),
        );
        assert_eq!(
            links,
            InstanceLinks::Known {
                summary: "http://localhost:8080/pipelines/abc-1".to_string(),
                status: "http://localhost:8080/pipelines/status/abc-1".to_string(),
            }
        );
        assert_eq!(
            InstanceLinks::for_instance("http://x", &InstanceRef::Unknown),
            InstanceLinks::Unknown
        );
    }

    #[test]
    fn test_summary_marks_unknown_instance() {
        let sample = StatsSample {
            instance: Some(InstanceLinks::Unknown),
            reports: vec![StatsEntry {
                id: "RTCTransport_0".to_string(),
                kind: "transport".to_string(),
                fields: vec![field("bytesSent", 10)],
            }],
        };
        let text = sample.summary();
        assert!(text.contains("Instance ID UNKNOWN"));
        assert!(text.contains("Report: transport"));
        assert!(text.contains("bytesSent: 10"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_poller_schedule_and_swallowed_failures() {
        let peer = Arc::new(CountingPeer {
            calls: AtomicU32::new(0),
        });
        let (notices, mut rx) = notice_channel();
        let links = InstanceLinks::for_instance("http://s", &InstanceRef::Known("i".to_string()));

        let handle = StatsPoller::spawn(
            peer.clone(),
            Some(links.clone()),
            Duration::from_secs(4),
            Duration::from_secs(6),
            notices,
        );

        tokio::time::sleep(Duration::from_millis(3900)).await;
        assert!(rx.try_recv().is_err());

        tokio::time::sleep(Duration::from_millis(200)).await;
        match rx.try_recv().unwrap() {
            Notice::Stats(sample) => assert_eq!(sample.instance, Some(links)),
            other => panic!("expected stats, got {:?}", other),
        }

        // Second sample fails and is skipped; the third arrives at 16 s.
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(rx.try_recv().is_err());
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(matches!(rx.try_recv().unwrap(), Notice::Stats(_)));

        handle.cancel();
        tokio::time::sleep(Duration::from_secs(12)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(peer.calls.load(Ordering::SeqCst), 3);
    }
}
