//! Media engine and API construction.
//!
//! Two separate APIs: voice rooms negotiate Opus only, screen rooms
//! negotiate VP8 video plus Opus audio. Both register the default
//! interceptor chain, which includes NACK generator/responder for
//! retransmission.

use anyhow::Result;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate_type::RTCIceCandidateType;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType,
};

const OPUS_VOICE_FMTP: &str = "minptime=10;useinbandfec=1;usedtx=1;maxaveragebitrate=128000";
const OPUS_SCREEN_FMTP: &str = "minptime=10;useinbandfec=1";

fn opus_params(fmtp: &str) -> RTCRtpCodecParameters {
    RTCRtpCodecParameters {
        capability: RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_owned(),
            clock_rate: 48000,
            channels: 2,
            sdp_fmtp_line: fmtp.to_owned(),
            ..Default::default()
        },
        payload_type: 111,
        ..Default::default()
    }
}

fn setting_engine(public_ip: Option<&str>) -> SettingEngine {
    let mut se = SettingEngine::default();
    if let Some(ip) = public_ip {
        se.set_nat_1to1_ips(vec![ip.to_owned()], RTCIceCandidateType::Host);
    }
    se
}

/// Opus-only API for voice rooms.
pub(crate) fn voice_api(public_ip: Option<&str>) -> Result<API> {
    let mut media_engine = MediaEngine::default();
    media_engine.register_codec(opus_params(OPUS_VOICE_FMTP), RTPCodecType::Audio)?;

    let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;

    Ok(APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .with_setting_engine(setting_engine(public_ip))
        .build())
}

/// VP8 + Opus API for screen-share rooms.
pub(crate) fn screen_api(public_ip: Option<&str>) -> Result<API> {
    let mut media_engine = MediaEngine::default();
    media_engine.register_codec(
        RTCRtpCodecParameters {
            capability: RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                clock_rate: 90000,
                ..Default::default()
            },
            payload_type: 96,
            ..Default::default()
        },
        RTPCodecType::Video,
    )?;
    media_engine.register_codec(opus_params(OPUS_SCREEN_FMTP), RTPCodecType::Audio)?;

    let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;

    Ok(APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .with_setting_engine(setting_engine(public_ip))
        .build())
}

pub(crate) fn rtc_configuration(ice_servers: &[String]) -> RTCConfiguration {
    let ice_servers = if ice_servers.is_empty() {
        Vec::new()
    } else {
        vec![RTCIceServer {
            urls: ice_servers.to_vec(),
            ..Default::default()
        }]
    };
    RTCConfiguration {
        ice_servers,
        ..Default::default()
    }
}
