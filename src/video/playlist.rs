use std::io::Read;

use base64::{engine::general_purpose::STANDARD, Engine};
use bytes::Bytes;
use flate2::read::GzDecoder;
use serde::Deserialize;

use crate::{
    crypto::MediaCrypto,
    error::MediaSDKError,
    file::{FileType, MediaFile},
};

pub const PLAYLIST_MIME_TYPE: &str = "application/vnd.apple.mpegurl";
pub const HLS_PLAYLIST_TYPE: &str = "hls_video";
/// Media reference the playlist generator writes in place of the real URL.
pub const MEDIA_PLACEHOLDER: &str = "\noutput.ts";

#[derive(uniffi::Record)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HLSPlaylistData {
    /// A `data:` URL of the playlist, typed so players accept it without a file extension.
    pub playlist_url: String,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileDataType {
    VidPreview,
}

impl FileDataType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileDataType::VidPreview => "vid_preview",
        }
    }
}

#[derive(Debug, Clone)]
pub struct EncryptedBlob {
    pub encrypted_data: Bytes,
    pub decryption_header: Vec<u8>,
}

/// Source of the derived data stored next to a file.
#[async_trait::async_trait]
pub trait FileDataClient: Send + Sync {
    async fn fetch_file_data(
        &self,
        kind: FileDataType,
        file_id: i64,
    ) -> Result<Option<EncryptedBlob>, MediaSDKError>;

    /// Presigned URL of the encrypted media the playlist points into. Segments are fetched from
    /// it with range requests.
    async fn fetch_file_preview_url(
        &self,
        kind: FileDataType,
        file_id: i64,
    ) -> Result<Option<String>, MediaSDKError>;
}

#[derive(Debug, Deserialize)]
pub struct PlaylistJSON {
    #[serde(rename = "type")]
    pub kind: String,
    pub playlist: String,
    pub width: u32,
    pub height: u32,
}

/// Builds a playable playlist for a video's streaming preview. `None` when the file has no
/// preview, or one in a format this version does not understand.
pub async fn hls_playlist_data_for_file(
    client: &dyn FileDataClient,
    crypto: &dyn MediaCrypto,
    file: &MediaFile,
) -> Result<Option<HLSPlaylistData>, MediaSDKError> {
    if file.file_type != FileType::Video {
        return Err(MediaSDKError::PreconditionFailed {
            reason: format!("File {} is not a video", file.id),
        });
    }

    let Some(encrypted) = client.fetch_file_data(FileDataType::VidPreview, file.id).await? else {
        return Ok(None);
    };

    let playlist = decrypt_playlist_json(crypto, &encrypted, &file.key)?;
    if playlist.kind != HLS_PLAYLIST_TYPE {
        return Ok(None);
    }

    let Some(video_url) = client.fetch_file_preview_url(FileDataType::VidPreview, file.id).await? else {
        return Ok(None);
    };

    let playlist_text = substitute_media_url(&playlist.playlist, &video_url);
    Ok(Some(HLSPlaylistData {
        playlist_url: playlist_data_url(&playlist_text),
        width: playlist.width,
        height: playlist.height,
    }))
}

/// The encrypted blob holds gzip compressed JSON.
pub fn decrypt_playlist_json(
    crypto: &dyn MediaCrypto,
    encrypted: &EncryptedBlob,
    key: &[u8],
) -> Result<PlaylistJSON, MediaSDKError> {
    let compressed = crypto.decrypt_whole(&encrypted.encrypted_data, &encrypted.decryption_header, key)?;

    let mut json = String::new();
    GzDecoder::new(&compressed[..])
        .read_to_string(&mut json)
        .map_err(|e| MediaSDKError::PlaylistError { err_str: e.to_string() })?;

    Ok(serde_json::from_str(&json)?)
}

/*
Every segment of the playlist is a byte range of one encrypted resource, so a single URL for the
whole resource replaces every placeholder line.
*/
pub fn substitute_media_url(template: &str, media_url: &str) -> String {
    template.replace(MEDIA_PLACEHOLDER, &format!("\n{}", media_url))
}

pub fn playlist_data_url(playlist: &str) -> String {
    format!("data:{};base64,{}", PLAYLIST_MIME_TYPE, STANDARD.encode(playlist))
}
