use std::io::{Cursor, Read};

use bytes::Bytes;

use crate::error::MediaSDKError;

/// Plaintext ready to hand to a renderer, with the type the renderer should assume.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderableBlob {
    pub data: Bytes,
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Renderable {
    /// The input can be rendered as is.
    Original { mime_type: Option<String> },
    Converted(RenderableBlob),
}

impl Renderable {
    pub fn mime_type(&self) -> Option<&str> {
        match self {
            Renderable::Original { mime_type } => mime_type.as_deref(),
            Renderable::Converted(blob) => blob.mime_type.as_deref(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LivePhoto {
    pub image_file_name: String,
    pub image_data: Bytes,
    pub video_file_name: String,
    pub video_data: Bytes,
}

/// Turns originals into something the host can display. `Ok(None)` means the format is not
/// supported, which is an expected outcome and not an error.
#[async_trait::async_trait]
pub trait MediaConverter: Send + Sync {
    async fn renderable_image(
        &self,
        file_name: &str,
        data: Bytes,
    ) -> Result<Option<Renderable>, MediaSDKError>;

    /// `force` asks for a conversion even if the original looks playable.
    async fn playable_video(
        &self,
        file_name: &str,
        data: Bytes,
        force: bool,
    ) -> Result<Option<Renderable>, MediaSDKError>;

    async fn decode_live_photo(&self, file_name: &str, data: Bytes) -> Result<LivePhoto, MediaSDKError>;
}

const RENDERABLE_IMAGE_TYPES: [&str; 8] = [
    "image/jpeg",
    "image/png",
    "image/gif",
    "image/webp",
    "image/bmp",
    "image/avif",
    "image/svg+xml",
    "image/x-icon",
];

const PLAYABLE_VIDEO_TYPES: [&str; 4] = ["video/mp4", "video/webm", "video/ogg", "video/quicktime"];

/// Accepts formats hosts can render natively and declines everything else. It never transcodes,
/// so `force` only matters to converters that can.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughConverter;

impl PassthroughConverter {
    fn accept(file_name: &str, allowed: &[&str]) -> Option<Renderable> {
        let mime = mime_guess::from_path(file_name).first()?;
        let mime = mime.essence_str();
        allowed.contains(&mime).then(|| Renderable::Original {
            mime_type: Some(mime.to_string()),
        })
    }
}

#[async_trait::async_trait]
impl MediaConverter for PassthroughConverter {
    async fn renderable_image(
        &self,
        file_name: &str,
        _data: Bytes,
    ) -> Result<Option<Renderable>, MediaSDKError> {
        Ok(Self::accept(file_name, &RENDERABLE_IMAGE_TYPES))
    }

    async fn playable_video(
        &self,
        file_name: &str,
        _data: Bytes,
        _force: bool,
    ) -> Result<Option<Renderable>, MediaSDKError> {
        Ok(Self::accept(file_name, &PLAYABLE_VIDEO_TYPES))
    }

    async fn decode_live_photo(&self, file_name: &str, data: Bytes) -> Result<LivePhoto, MediaSDKError> {
        decode_live_photo_archive(file_name, &data)
    }
}

/*
A live photo is stored as a zip with one image and one video entry. The component names keep the
stem of the live photo title and take the extension of their entry.
*/
pub fn decode_live_photo_archive(file_name: &str, data: &[u8]) -> Result<LivePhoto, MediaSDKError> {
    let mut archive = zip::ZipArchive::new(Cursor::new(data)).map_err(conversion_error)?;
    let stem = file_stem(file_name);

    let mut image: Option<(String, Bytes)> = None;
    let mut video: Option<(String, Bytes)> = None;

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i).map_err(conversion_error)?;
        if entry.is_dir() {
            continue;
        }

        let entry_name = entry.name().to_string();
        let Some(mime) = mime_guess::from_path(&entry_name).first() else {
            continue;
        };
        let slot = match mime.type_().as_str() {
            "image" if image.is_none() => &mut image,
            "video" if video.is_none() => &mut video,
            _ => continue,
        };

        let mut buffer = Vec::with_capacity(entry.size() as usize);
        entry.read_to_end(&mut buffer)?;

        let name = match extension(&entry_name) {
            Some(ext) => format!("{}.{}", stem, ext),
            None => stem.to_string(),
        };
        *slot = Some((name, Bytes::from(buffer)));
    }

    match (image, video) {
        (Some((image_file_name, image_data)), Some((video_file_name, video_data))) => Ok(LivePhoto {
            image_file_name,
            image_data,
            video_file_name,
            video_data,
        }),
        _ => Err(MediaSDKError::ConversionError {
            err_str: format!("Live photo {} is missing a component", file_name),
        }),
    }
}

fn file_stem(file_name: &str) -> &str {
    match file_name.rfind('.') {
        Some(0) | None => file_name,
        Some(index) => &file_name[..index],
    }
}

fn extension(file_name: &str) -> Option<&str> {
    let base = file_name.rsplit('/').next().unwrap_or(file_name);
    match base.rfind('.') {
        Some(0) | None => None,
        Some(index) => Some(&base[index + 1..]),
    }
}

fn conversion_error(err: zip::result::ZipError) -> MediaSDKError {
    MediaSDKError::ConversionError { err_str: err.to_string() }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::io::Write;

    use super::*;

    pub(crate) fn live_photo_zip(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        for (name, data) in entries {
            writer.start_file(*name, zip::write::FileOptions::default()).unwrap();
            writer.write_all(data).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    #[async_std::test]
    async fn test_passthrough_accepts_native_formats() {
        let converter = PassthroughConverter;

        let jpeg = converter.renderable_image("a.JPG", Bytes::new()).await.unwrap();
        assert_eq!(jpeg.unwrap().mime_type(), Some("image/jpeg"));
        assert!(converter.renderable_image("a.heic", Bytes::new()).await.unwrap().is_none());
        assert!(converter.renderable_image("no_extension", Bytes::new()).await.unwrap().is_none());

        let mp4 = converter.playable_video("clip.mp4", Bytes::new(), false).await.unwrap();
        assert_eq!(mp4, Some(Renderable::Original { mime_type: Some("video/mp4".to_string()) }));
        assert!(converter.playable_video("clip.mkv", Bytes::new(), true).await.unwrap().is_none());
    }

    #[test]
    fn test_decode_live_photo() {
        let zip = live_photo_zip(&[("IMG_1.JPG", &b"image bytes"[..]), ("IMG_1.MOV", &b"video bytes"[..])]);
        let live = decode_live_photo_archive("holiday.zip", &zip).unwrap();

        assert_eq!(live.image_file_name, "holiday.JPG");
        assert_eq!(live.image_data, Bytes::from_static(b"image bytes"));
        assert_eq!(live.video_file_name, "holiday.MOV");
        assert_eq!(live.video_data, Bytes::from_static(b"video bytes"));
    }

    #[test]
    fn test_decode_live_photo_missing_component() {
        let zip = live_photo_zip(&[("IMG_1.jpg", &b"image bytes"[..])]);
        let err = decode_live_photo_archive("holiday", &zip).unwrap_err();
        assert!(matches!(err, MediaSDKError::ConversionError { .. }));

        let err = decode_live_photo_archive("holiday", b"not a zip").unwrap_err();
        assert!(matches!(err, MediaSDKError::ConversionError { .. }));
    }
}
