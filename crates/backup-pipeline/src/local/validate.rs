use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::collab::Validator;
use crate::config::BackupKey;
use crate::local::format::{self, Sealer};
use crate::media::MediaObject;
use crate::outcome::ValidationOutcome;

/// Re-reads an exported artifact and checks framing, digest and every sealed frame.
#[derive(Debug, Clone, Default)]
pub struct ArtifactValidator {
    pub allow_plaintext: bool,
}

enum Fault {
    Read(String),
    Invalid(String),
}

impl From<Fault> for ValidationOutcome {
    fn from(f: Fault) -> Self {
        match f {
            Fault::Read(m) => ValidationOutcome::ReadError(m),
            Fault::Invalid(m) => ValidationOutcome::ValidationError(m),
        }
    }
}

fn read_exact(r: &mut impl Read, buf: &mut [u8], what: &str) -> Result<(), Fault> {
    r.read_exact(buf).map_err(|e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            Fault::Invalid(format!("artifact truncated in {what}"))
        } else {
            Fault::Read(format!("failed to read {what}: {e}"))
        }
    })
}

#[derive(Debug, Default)]
struct Summary {
    entries: usize,
    media: usize,
}

impl ArtifactValidator {
    fn check(&self, path: &Path, key: &BackupKey) -> Result<Summary, Fault> {
        let file = File::open(path)
            .map_err(|e| Fault::Read(format!("failed to open {}: {e}", path.display())))?;
        let total = file
            .metadata()
            .map_err(|e| Fault::Read(format!("failed to stat {}: {e}", path.display())))?
            .len();
        let mut r = BufReader::new(file);
        let mut hasher = Sha256::new();
        let mut consumed = 0u64;

        let mut header = [0u8; format::HEADER_LEN];
        read_exact(&mut r, &mut header, "header")?;
        if &header[..4] != format::MAGIC {
            return Err(Fault::Invalid("not a backup artifact (bad magic)".into()));
        }
        if header[4] != format::VERSION {
            return Err(Fault::Invalid(format!(
                "unsupported artifact version {}",
                header[4]
            )));
        }
        let encrypted = header[5] & format::FLAG_ENCRYPTED != 0;
        if !encrypted && !self.allow_plaintext {
            return Err(Fault::Invalid("artifact is not encrypted".into()));
        }
        hasher.update(header);
        consumed += header.len() as u64;

        let sealer = Sealer::new(key, encrypted);
        let mut summary = Summary::default();
        loop {
            let mut fh = [0u8; 5];
            read_exact(&mut r, &mut fh, "frame header")?;
            let tag = fh[0];
            let len = u32::from_le_bytes([fh[1], fh[2], fh[3], fh[4]]) as u64;
            consumed += fh.len() as u64;
            if consumed + len > total {
                return Err(Fault::Invalid(format!(
                    "frame length {len} runs past end of artifact"
                )));
            }
            let mut body = vec![0u8; len as usize];
            read_exact(&mut r, &mut body, "frame body")?;
            consumed += len;

            if tag == format::TAG_TRAILER {
                if body.len() != format::DIGEST_LEN {
                    return Err(Fault::Invalid("malformed trailer".into()));
                }
                let digest: [u8; format::DIGEST_LEN] = hasher.finalize().into();
                if digest.as_slice() != body.as_slice() {
                    return Err(Fault::Invalid("artifact digest mismatch".into()));
                }
                if consumed != total {
                    return Err(Fault::Invalid("trailing bytes after trailer".into()));
                }
                return Ok(summary);
            }

            hasher.update(fh);
            hasher.update(&body);
            let plain = sealer.open(&body).map_err(Fault::Invalid)?;
            match tag {
                format::TAG_ENTRY => {
                    format::decode_entry(&plain).map_err(Fault::Invalid)?;
                    summary.entries += 1;
                }
                format::TAG_MEDIA => {
                    serde_json::from_slice::<MediaObject>(&plain)
                        .map_err(|e| Fault::Invalid(format!("malformed media frame: {e}")))?;
                    summary.media += 1;
                }
                other => {
                    return Err(Fault::Invalid(format!("unknown frame tag 0x{other:02x}")));
                }
            }
        }
    }
}

impl Validator for ArtifactValidator {
    fn validate(&self, artifact: &Path, key: &BackupKey) -> ValidationOutcome {
        match self.check(artifact, key) {
            Ok(summary) => {
                tracing::debug!(entries = summary.entries, media = summary.media, "artifact validated");
                ValidationOutcome::Success
            }
            Err(fault) => fault.into(),
        }
    }
}
