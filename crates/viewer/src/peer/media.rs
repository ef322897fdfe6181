//! Local capture tracks

use crate::config::MediaConstraints;
use crate::{Error, Result};
use std::sync::Arc;
use tracing::{debug, info, warn};
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

/// Kind of a local track
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    /// Audio
    Audio,
    /// Video
    Video,
}

impl MediaKind {
    /// `audio` / `video`
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
        }
    }

    fn codec(&self) -> RTCRtpCodecCapability {
        match self {
            MediaKind::Audio => RTCRtpCodecCapability {
                mime_type: "audio/opus".to_string(),
                clock_rate: 48000,
                channels: 2,
                sdp_fmtp_line: String::new(),
                rtcp_feedback: vec![],
            },
            MediaKind::Video => RTCRtpCodecCapability {
                mime_type: "video/VP8".to_string(),
                clock_rate: 90000,
                channels: 0,
                sdp_fmtp_line: String::new(),
                rtcp_feedback: vec![],
            },
        }
    }
}

/// One local track and the sender carrying it
#[derive(Debug)]
pub struct LocalTrack {
    kind: MediaKind,
    id: String,
    sender: Option<Arc<RTCRtpSender>>,
}

impl LocalTrack {
    /// Track without a sender (not attached to any connection)
    pub fn detached(kind: MediaKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
            sender: None,
        }
    }

    /// Track kind
    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    /// Track id
    pub fn id(&self) -> &str {
        &self.id
    }
}

/// Local tracks acquired for one call attempt.
///
/// Senders are stopped by [`LocalMedia::release`]; a value dropped without
/// being released stops them on a background task.
#[derive(Debug, Default)]
pub struct LocalMedia {
    tracks: Vec<LocalTrack>,
    released: bool,
}

impl LocalMedia {
    /// Wrap acquired tracks
    pub fn new(tracks: Vec<LocalTrack>) -> Self {
        Self {
            tracks,
            released: false,
        }
    }

    /// Kinds of the held tracks
    pub fn kinds(&self) -> Vec<MediaKind> {
        self.tracks.iter().map(|t| t.kind).collect()
    }

    /// Held tracks
    pub fn tracks(&self) -> &[LocalTrack] {
        &self.tracks
    }

    /// True once released
    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Stop every sender. Safe to call more than once.
    pub async fn release(&mut self) {
        if self.released {
            return;
        }
        for track in &mut self.tracks {
            if let Some(sender) = track.sender.take() {
                if let Err(e) = sender.stop().await {
                    warn!("Failed to stop local {} track {}: {}", track.kind.as_str(), track.id, e);
                }
            }
        }
        self.released = true;
        info!(tracks = self.tracks.len(), "Released local media");
    }
}

impl Drop for LocalMedia {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let senders: Vec<Arc<RTCRtpSender>> =
            self.tracks.iter_mut().filter_map(|t| t.sender.take()).collect();
        if senders.is_empty() {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    for sender in senders {
                        if let Err(e) = sender.stop().await {
                            debug!("Failed to stop sender on drop: {}", e);
                        }
                    }
                });
            }
            Err(_) => warn!("LocalMedia dropped outside a runtime, senders not stopped"),
        }
    }
}

/// Add one sample track per requested kind to `peer_connection`
pub async fn attach_local_media(
    peer_connection: &RTCPeerConnection,
    constraints: MediaConstraints,
    stream_id: &str,
) -> Result<LocalMedia> {
    let mut kinds = Vec::new();
    if constraints.video {
        kinds.push(MediaKind::Video);
    }
    if constraints.audio {
        kinds.push(MediaKind::Audio);
    }

    let mut media = LocalMedia::default();
    for kind in kinds {
        let id = format!("{}-{}", kind.as_str(), stream_id);
        let track = Arc::new(TrackLocalStaticSample::new(
            kind.codec(),
            id.clone(),
            format!("stream-{}", stream_id),
        ));

        let sender = peer_connection
            .add_track(track as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| {
                Error::MediaTrackError(format!("Failed to add {} track: {}", kind.as_str(), e))
            })?;

        debug!("Added local {} track {}", kind.as_str(), id);
        media.tracks.push(LocalTrack {
            kind,
            id,
            sender: Some(sender),
        });
    }

    Ok(media)
}
