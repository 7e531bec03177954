//! VITS HTTP 语音合成（Style-Bert-VITS2 / Bert-VITS2）

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::config::{TtsEngine, TtsSection};
use crate::playback::{AudioClip, AudioError, AudioSynthesis};

#[derive(Serialize)]
struct StyleBertVits2Request<'a> {
    text: &'a str,
    ident: &'a str,
    sdp_ratio: f32,
    length_scale: f32,
}

#[derive(Serialize)]
struct BertVits2Request<'a> {
    id: u32,
    format: &'a str,
    lang: &'a str,
    length: f32,
    noise: f32,
    noisew: f32,
    segment_size: u32,
    sdp_ratio: f32,
    text: &'a str,
}

pub struct HttpSynthesis {
    client: reqwest::Client,
    endpoint: String,
    config: TtsSection,
}

impl HttpSynthesis {
    pub fn new(config: TtsSection) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .unwrap_or_default();
        Self {
            client,
            endpoint: endpoint_url(&config.base_url, config.engine),
            config,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn request(&self, text: &str) -> reqwest::RequestBuilder {
        let req = self.client.post(&self.endpoint);
        match self.config.engine {
            TtsEngine::StyleBertVits2 => req.json(&StyleBertVits2Request {
                text,
                ident: &self.config.ident,
                sdp_ratio: self.config.sdp_ratio,
                length_scale: self.config.length_scale,
            }),
            TtsEngine::BertVits2 => {
                let bv2 = &self.config.bert_vits2;
                req.json(&BertVits2Request {
                    id: bv2.speaker_id,
                    format: &bv2.format,
                    lang: &bv2.lang,
                    length: bv2.length,
                    noise: bv2.noise,
                    noisew: bv2.noisew,
                    segment_size: bv2.segment_size,
                    sdp_ratio: bv2.sdp_ratio,
                    text,
                })
            }
        }
    }
}

/// 规范化服务地址：补协议、缺端口时补默认端口、补引擎路径
pub fn endpoint_url(base: &str, engine: TtsEngine) -> String {
    let path = match engine {
        TtsEngine::StyleBertVits2 => "/synthesize",
        TtsEngine::BertVits2 => "/voice/bert-vits2",
    };
    let base = base.trim();
    if base.starts_with("http://") || base.starts_with("https://") {
        if base.contains(path) {
            return base.to_string();
        }
        return format!("{}{}", base.trim_end_matches('/'), path);
    }

    let mut host = base.trim_end_matches('/').to_string();
    if !host.contains(':') {
        let port = match engine {
            TtsEngine::StyleBertVits2 => 23456,
            TtsEngine::BertVits2 => 6006,
        };
        host = format!("{host}:{port}");
    }
    format!("http://{host}{path}")
}

#[async_trait]
impl AudioSynthesis for HttpSynthesis {
    async fn synthesize(&self, text: &str) -> Result<AudioClip, AudioError> {
        let resp = self
            .request(text)
            .send()
            .await
            .map_err(|e| AudioError::Synthesis(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(AudioError::Synthesis(format!("{} returned {}: {}", self.endpoint, status, body)));
        }
        let mime = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("audio/wav")
            .to_string();
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| AudioError::Synthesis(e.to_string()))?;
        if bytes.is_empty() {
            return Err(AudioError::Synthesis("empty audio body".to_string()));
        }
        Ok(AudioClip::new(bytes.to_vec(), mime))
    }
}
