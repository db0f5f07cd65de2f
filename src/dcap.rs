//! Oracle backed by a DCAP quote verification library loaded at runtime.
//!
//! The library must export `sgx_qv_get_quote_supplemental_data_size` and
//! `sgx_qv_verify_quote` with the Intel DCAP QVL signatures.

use crate::error::{Error, Result};
use crate::oracle::{AttestationOracle, VerificationOutcome};
use libloading::Library;
use std::ffi::c_void;
use std::path::{Path, PathBuf};
use std::ptr;
use tracing::{debug, info};

pub const DEFAULT_LIBRARY_PATH: &str = "libdcap_quoteverify_stub.so";

type VerifyQuoteFn = unsafe extern "C" fn(
    p_quote: *const u8,
    quote_size: u32,
    p_quote_collateral: *const c_void,
    expiration_check_date: i64,
    p_collateral_expiration_status: *mut u32,
    p_quote_verification_result: *mut u32,
    p_qve_report_info: *mut c_void,
    supplemental_data_size: u32,
    p_supplemental_data: *mut u8,
) -> u32;

type SupplementalDataSizeFn = unsafe extern "C" fn(p_data_size: *mut u32) -> u32;

/// Quote verifier calling into a native DCAP library.
pub struct DcapOracle {
    verify_quote: VerifyQuoteFn,
    supplemental_data_size: SupplementalDataSizeFn,
    path: PathBuf,
    // Keeps the resolved symbols valid.
    _library: Library,
}

impl DcapOracle {
    /// Load the library, trying `path` as given and then relative to the
    /// current directory. Failing to load or resolve symbols is a configuration
    /// error.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut candidates = vec![path.to_path_buf()];
        if let Ok(cwd) = std::env::current_dir() {
            candidates.push(cwd.join(path));
        }

        let mut last_error = None;
        for candidate in candidates {
            // SAFETY: loading runs the library's initialisers; the path is
            // operator supplied and expected to be a DCAP verification library.
            match unsafe { Library::new(&candidate) } {
                Ok(library) => return Self::from_library(library, candidate),
                Err(e) => last_error = Some(e),
            }
        }

        Err(Error::Configuration(format!(
            "unable to load DCAP verification library from '{}': {}",
            path.display(),
            last_error.map_or_else(|| "no candidate paths".to_string(), |e| e.to_string())
        )))
    }

    fn from_library(library: Library, path: PathBuf) -> Result<Self> {
        // SAFETY: the symbol types match the DCAP QVL C declarations. The
        // function pointers are only used while `library` is alive, which the
        // struct guarantees.
        let (verify_quote, supplemental_data_size) = unsafe {
            let verify_quote = *library
                .get::<VerifyQuoteFn>(b"sgx_qv_verify_quote\0")
                .map_err(|e| Error::Configuration(format!("{}: {e}", path.display())))?;
            let supplemental_data_size = *library
                .get::<SupplementalDataSizeFn>(b"sgx_qv_get_quote_supplemental_data_size\0")
                .map_err(|e| Error::Configuration(format!("{}: {e}", path.display())))?;
            (verify_quote, supplemental_data_size)
        };

        info!("Loaded DCAP verification library from {}", path.display());

        Ok(Self {
            verify_quote,
            supplemental_data_size,
            path,
            _library: library,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AttestationOracle for DcapOracle {
    fn verify(&self, quote: &[u8]) -> Result<VerificationOutcome> {
        if quote.is_empty() {
            return Err(Error::VerificationFailed("empty quote provided for verification".into()));
        }
        let quote_size = u32::try_from(quote.len())
            .map_err(|_| Error::VerificationFailed(format!("quote too large: {} bytes", quote.len())))?;

        let mut supplemental_size = 0u32;
        // SAFETY: the out pointer refers to a live, writable u32.
        let size_status = unsafe { (self.supplemental_data_size)(&mut supplemental_size) };
        let mut supplemental = if size_status == 0 && supplemental_size > 0 {
            vec![0u8; supplemental_size as usize]
        } else {
            Vec::new()
        };
        let supplemental_ptr = if supplemental.is_empty() {
            ptr::null_mut()
        } else {
            supplemental.as_mut_ptr()
        };

        let mut collateral_expiration_status = 1u32;
        let mut result_code = 0u32;
        let now = chrono::Utc::now().timestamp();

        // SAFETY: `quote` outlives the call and its length is passed alongside;
        // the supplemental buffer is either null with length 0 or exactly
        // `supplemental.len()` bytes; out pointers refer to live locals.
        let status = unsafe {
            (self.verify_quote)(
                quote.as_ptr(),
                quote_size,
                ptr::null(),
                now,
                &mut collateral_expiration_status,
                &mut result_code,
                ptr::null_mut(),
                supplemental.len() as u32,
                supplemental_ptr,
            )
        };

        let outcome = VerificationOutcome {
            status,
            collateral_expiration_status,
            result_code,
        }
        .ensure_success()?;

        debug!("DCAP verification succeeded: {}", outcome);
        Ok(outcome)
    }
}
