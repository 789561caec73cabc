use std::io::{self, Read};

use flate2::read::MultiGzDecoder;

use crate::digest::{Algorithm, Digest, DigestHasher};
use crate::error::{Error, Result};
use crate::store::{open_descriptor, Store};
use crate::types::{media_type, Descriptor};

/// compression applied to a layer tar
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Compression {
    None,
    Gzip,
    Zstd,
}

impl Compression {
    /// pick the decoder for a layer media type
    pub fn from_media_type(mt: &str) -> Result<Self> {
        match mt {
            media_type::LAYER_TAR | media_type::LAYER_NONDISTRIBUTABLE_TAR => Ok(Self::None),
            media_type::LAYER_TAR_GZIP
            | media_type::LAYER_NONDISTRIBUTABLE_TAR_GZIP
            | media_type::DOCKER_LAYER_TAR_GZIP => Ok(Self::Gzip),
            media_type::LAYER_TAR_ZSTD | media_type::LAYER_NONDISTRIBUTABLE_TAR_ZSTD => {
                Ok(Self::Zstd)
            }
            other => Err(Error::UnsupportedMediaType(other.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Compression::None => "none",
            Compression::Gzip => "gzip",
            Compression::Zstd => "zstd",
        }
    }
}

/// wrap a raw layer stream in the decoder its media type calls for
pub fn decompress<'a, R: Read + 'a>(mt: &str, reader: R) -> Result<Box<dyn Read + 'a>> {
    match Compression::from_media_type(mt)? {
        Compression::None => Ok(Box::new(reader)),
        Compression::Gzip => Ok(Box::new(MultiGzDecoder::new(reader))),
        Compression::Zstd => {
            let decoder = zstd::stream::read::Decoder::new(reader).map_err(Error::from_stream)?;
            Ok(Box::new(decoder))
        }
    }
}

/// hashes the decompressed tar stream to produce the layer's diff id
pub struct DiffIdReader<R> {
    inner: R,
    hasher: DigestHasher,
    read: u64,
}

impl<R: Read> DiffIdReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            hasher: DigestHasher::new(Algorithm::Sha256),
            read: 0,
        }
    }

    /// drain the rest of the stream, then return the diff id and length
    pub fn finish(mut self) -> Result<(Digest, u64)> {
        io::copy(&mut self, &mut io::sink()).map_err(Error::from_stream)?;
        Ok((self.hasher.finalize(), self.read))
    }
}

impl<R: Read> Read for DiffIdReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        self.read += n as u64;
        Ok(n)
    }
}

/// digest of the decompressed layer a descriptor names
pub fn compute_diff_id(store: &Store, desc: &Descriptor) -> Result<Digest> {
    let mut blob = open_descriptor(store, desc)?;
    let (diff_id, _) = DiffIdReader::new(decompress(&desc.media_type, &mut blob)?).finish()?;
    blob.finish()?;
    Ok(diff_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::gzip;

    fn read_all(mut r: Box<dyn Read + '_>) -> Vec<u8> {
        let mut out = Vec::new();
        r.read_to_end(&mut out).unwrap();
        out
    }

    #[test]
    fn test_media_type_dispatch() {
        assert_eq!(
            Compression::from_media_type(media_type::LAYER_TAR).unwrap(),
            Compression::None
        );
        assert_eq!(
            Compression::from_media_type(media_type::DOCKER_LAYER_TAR_GZIP).unwrap(),
            Compression::Gzip
        );
        assert_eq!(
            Compression::from_media_type(media_type::LAYER_NONDISTRIBUTABLE_TAR_ZSTD).unwrap(),
            Compression::Zstd
        );
        assert!(matches!(
            Compression::from_media_type("application/vnd.oci.image.layer.v1.tar+bzip2"),
            Err(Error::UnsupportedMediaType(_))
        ));
    }

    #[test]
    fn test_decompress_gzip() {
        let data = gzip(b"layer bytes");
        let out = read_all(decompress(media_type::LAYER_TAR_GZIP, data.as_slice()).unwrap());
        assert_eq!(out, b"layer bytes");
    }

    #[test]
    fn test_decompress_multi_member_gzip() {
        let mut data = gzip(b"first ");
        data.extend(gzip(b"second"));
        let out = read_all(decompress(media_type::LAYER_TAR_GZIP, data.as_slice()).unwrap());
        assert_eq!(out, b"first second");
    }

    #[test]
    fn test_decompress_zstd() {
        let data = zstd::encode_all(&b"zstd layer"[..], 3).unwrap();
        let out = read_all(decompress(media_type::LAYER_TAR_ZSTD, data.as_slice()).unwrap());
        assert_eq!(out, b"zstd layer");
    }

    #[test]
    fn test_compute_diff_id() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::init(dir.path()).unwrap();
        let blob = gzip(b"uncompressed tar");
        let (digest, size) = crate::store::put_blob(&store, &mut blob.as_slice()).unwrap();
        let desc = Descriptor::new(media_type::LAYER_TAR_GZIP, digest, size);

        assert_eq!(
            compute_diff_id(&store, &desc).unwrap(),
            Digest::sha256_of(b"uncompressed tar")
        );
    }

    #[test]
    fn test_diff_id_covers_undrained_tail() {
        let data = b"head and tail";
        let mut reader = DiffIdReader::new(&data[..]);
        let mut head = [0u8; 4];
        reader.read_exact(&mut head).unwrap();

        let (diff_id, len) = reader.finish().unwrap();
        assert_eq!(diff_id, Digest::sha256_of(data));
        assert_eq!(len, data.len() as u64);
    }
}
