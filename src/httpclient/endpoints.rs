use url::Url;

use crate::{
    error::MediaSDKError,
    file::{EncryptedBlobRef, RequestKind},
};

pub struct FileEndpoint {
    /// Hosted endpoint, the file id goes into the `fileID` query parameter.
    pub default_url: &'static str,
    /// Path under a custom origin, the file id is appended to it.
    pub custom_path: &'static str,
}

impl FileEndpoint {
    pub fn url_for(&self, file_id: i64, custom_origin: Option<&str>) -> Result<Url, MediaSDKError> {
        let url = match custom_origin {
            Some(origin) => Url::parse(&format!("{}{}{}", origin, self.custom_path, file_id)),
            None => Url::parse_with_params(self.default_url, &[("fileID", file_id.to_string())]),
        };

        url.map_err(|e| MediaSDKError::PreconditionFailed {
            reason: format!("Invalid file URL: {}", e),
        })
    }
}

macro_rules! define_endpoints {
    ($($name:ident => ($default_url:expr, $custom_path:expr)),* $(,)?) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub enum Endpoints {
            $(
                $name,
            )*
        }

        impl Endpoints {
            pub fn get_endpoint(&self) -> FileEndpoint {
                match self {
                    $(
                        Endpoints::$name => FileEndpoint {
                            default_url: $default_url,
                            custom_path: $custom_path,
                        },
                    )*
                }
            }
        }
    };
}

define_endpoints![
    // Authenticated user
    Thumbnail => ("https://thumbnails.ente.io/", "/files/preview/"),
    File => ("https://files.ente.io/", "/files/download/"),

    // Public link
    PublicThumbnail => ("https://public-albums.ente.io/preview/", "/public-collection/files/preview/"),
    PublicFile => ("https://public-albums.ente.io/download/", "/public-collection/files/download/"),
];

/// Deployment mode a request is made in, stream previews share the file endpoint.
#[derive(Debug, Clone, Copy)]
pub enum FileURL {
    Photos,
    PublicAlbums,
}

impl FileURL {
    pub fn endpoint(&self, kind: RequestKind) -> Endpoints {
        match (self, kind) {
            (FileURL::Photos, RequestKind::Thumbnail) => Endpoints::Thumbnail,
            (FileURL::Photos, _) => Endpoints::File,
            (FileURL::PublicAlbums, RequestKind::Thumbnail) => Endpoints::PublicThumbnail,
            (FileURL::PublicAlbums, _) => Endpoints::PublicFile,
        }
    }
}

pub fn string_url(
    url: &FileURL,
    blob: &EncryptedBlobRef,
    custom_origin: Option<&str>,
) -> Result<Url, MediaSDKError> {
    url.endpoint(blob.kind).get_endpoint().url_for(blob.file_id, custom_origin)
}
