use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status};

use crate::commands::{QualityPreset, StreamConfig};
use crate::service::{
    livecast_server::Livecast, CancelScheduleRequest, CommandAck, GetStatusRequest, LogLine,
    ScheduleStreamRequest, StartStreamRequest, StatusResponse, StopStreamRequest, StreamSettings,
    TailLogsRequest,
};
use crate::session::StreamManager;

pub struct ServerInner {
    manager: Arc<StreamManager>,
}

impl ServerInner {
    pub fn new(manager: Arc<StreamManager>) -> Self {
        ServerInner { manager }
    }
}

fn config_from_settings(settings: Option<StreamSettings>) -> Result<StreamConfig, Status> {
    let Some(settings) = settings else {
        return Ok(StreamConfig::default());
    };
    let defaults = StreamConfig::default();
    let preset = if settings.preset.is_empty() {
        defaults.preset
    } else {
        QualityPreset::parse(&settings.preset).ok_or_else(|| {
            Status::invalid_argument(format!("unknown quality preset: {}", settings.preset))
        })?
    };
    Ok(StreamConfig {
        vertical_mode: settings.vertical_mode,
        preset,
        video_bitrate: if settings.video_bitrate.is_empty() {
            defaults.video_bitrate
        } else {
            settings.video_bitrate
        },
        audio_bitrate: if settings.audio_bitrate.is_empty() {
            defaults.audio_bitrate
        } else {
            settings.audio_bitrate
        },
    })
}

fn parse_unix(seconds: i64) -> Result<DateTime<Utc>, Status> {
    DateTime::<Utc>::from_timestamp(seconds, 0)
        .ok_or_else(|| Status::invalid_argument(format!("unrepresentable timestamp: {}", seconds)))
}

#[tonic::async_trait]
impl Livecast for ServerInner {
    async fn start_stream(
        &self,
        request: Request<StartStreamRequest>,
    ) -> Result<Response<CommandAck>, Status> {
        let request = request.into_inner();
        let config = config_from_settings(request.settings)?;
        let ok = self
            .manager
            .start_streaming(&request.source, &request.stream_key, config)
            .await;
        Ok(Response::new(CommandAck { ok }))
    }

    async fn stop_stream(
        &self,
        _request: Request<StopStreamRequest>,
    ) -> Result<Response<CommandAck>, Status> {
        let ok = self.manager.stop_streaming().await;
        Ok(Response::new(CommandAck { ok }))
    }

    async fn schedule_stream(
        &self,
        request: Request<ScheduleStreamRequest>,
    ) -> Result<Response<CommandAck>, Status> {
        let request = request.into_inner();
        let config = config_from_settings(request.settings)?;
        let target = parse_unix(request.start_at_unix)?;
        let ok = self
            .manager
            .schedule_stream(&request.source, &request.stream_key, config, target)
            .await;
        Ok(Response::new(CommandAck { ok }))
    }

    async fn cancel_schedule(
        &self,
        _request: Request<CancelScheduleRequest>,
    ) -> Result<Response<CommandAck>, Status> {
        let ok = self.manager.cancel_schedule().await;
        Ok(Response::new(CommandAck { ok }))
    }

    async fn get_status(
        &self,
        _request: Request<GetStatusRequest>,
    ) -> Result<Response<StatusResponse>, Status> {
        let active = self.manager.is_active().await;
        let scheduled_at_unix = self
            .manager
            .scheduled_at()
            .await
            .map(|at| at.timestamp())
            .unwrap_or(0);
        let duration_seconds = self.manager.stream_duration_secs().await;
        Ok(Response::new(StatusResponse {
            active,
            scheduled_at_unix,
            duration_seconds,
        }))
    }

    type TailLogsStream = ReceiverStream<Result<LogLine, Status>>;

    async fn tail_logs(
        &self,
        _request: Request<TailLogsRequest>,
    ) -> Result<Response<Self::TailLogsStream>, Status> {
        let (tx, rx) = mpsc::channel(64);
        // the sink hands both out under one lock: no line is lost between
        // the snapshot and the live feed, and none is delivered twice
        let (snapshot, mut live) = self.manager.logs().snapshot_and_subscribe();

        tokio::spawn(async move {
            for line in snapshot {
                if tx.send(Ok(LogLine { line })).await.is_err() {
                    return;
                }
            }
            loop {
                match live.recv().await {
                    Ok(line) => {
                        if tx.send(Ok(LogLine { line })).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_settings_fall_back_to_defaults() {
        let config = config_from_settings(None).unwrap();
        assert_eq!(config.preset, QualityPreset::Veryfast);
        assert_eq!(config.video_bitrate, "2500k");
        assert_eq!(config.audio_bitrate, "128k");
        assert!(!config.vertical_mode);
    }

    #[test]
    fn empty_fields_fall_back_per_field() {
        let config = config_from_settings(Some(StreamSettings {
            vertical_mode: true,
            preset: "fast".to_string(),
            video_bitrate: String::new(),
            audio_bitrate: "192k".to_string(),
        }))
        .unwrap();
        assert!(config.vertical_mode);
        assert_eq!(config.preset, QualityPreset::Fast);
        assert_eq!(config.video_bitrate, "2500k");
        assert_eq!(config.audio_bitrate, "192k");
    }

    #[test]
    fn unknown_preset_is_invalid_argument() {
        let err = config_from_settings(Some(StreamSettings {
            vertical_mode: false,
            preset: "warp9".to_string(),
            video_bitrate: String::new(),
            audio_bitrate: String::new(),
        }))
        .unwrap_err();
        assert_eq!(err.code(), tonic::Code::InvalidArgument);
    }
}
