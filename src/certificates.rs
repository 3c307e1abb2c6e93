use std::path::{Path, PathBuf};

use tracing::info;

use crate::api::{ApiClient, CatalogApi};
use crate::error::CertificateError;
use crate::models::{Certificate, CertificateId, Progress, Video};
use crate::views::completion_percent;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CertificateEligibility {
    pub passed: usize,
    /// Active videos only.
    pub total: usize,
}

impl CertificateEligibility {
    pub fn evaluate(videos: &[Video], progress: &Progress) -> Self {
        Self {
            passed: progress.videos_passed.len(),
            total: videos.iter().filter(|v| v.is_active).count(),
        }
    }

    pub fn is_eligible(&self) -> bool {
        self.total > 0 && self.passed == self.total
    }

    pub fn percent(&self) -> u32 {
        completion_percent(self.passed, self.total)
    }
}

pub fn file_name(id: CertificateId) -> String {
    format!("certificate_{id}.pdf")
}

pub struct Certificates {
    api: ApiClient,
    pub issued: Vec<Certificate>,
    pub eligibility: CertificateEligibility,
}

impl Certificates {
    pub async fn load(api: ApiClient) -> Result<Self, CertificateError> {
        let issued = api.certificates().await?;
        let (videos, progress) = tokio::try_join!(api.videos(), api.progress())?;
        let eligibility = CertificateEligibility::evaluate(&videos, &progress);
        info!(
            issued = issued.len(),
            passed = eligibility.passed,
            total = eligibility.total,
            "certificates loaded"
        );
        Ok(Self {
            api,
            issued,
            eligibility,
        })
    }

    /// Refused locally, without a request, until every active video is passed.
    pub async fn generate(&mut self) -> Result<Certificate, CertificateError> {
        if !self.eligibility.is_eligible() {
            return Err(CertificateError::NotEligible {
                passed: self.eligibility.passed,
                total: self.eligibility.total,
            });
        }
        let certificate = self.api.generate_certificate().await?;
        info!(id = certificate.id, unique_id = %certificate.unique_id, "certificate generated");
        self.issued.push(certificate.clone());
        Ok(certificate)
    }

    pub async fn download(&self, id: CertificateId, dir: &Path) -> Result<PathBuf, CertificateError> {
        let bytes = self.api.download_certificate(id).await?;
        let path = dir.join(file_name(id));
        tokio::fs::write(&path, &bytes).await?;
        info!(path = %path.display(), bytes = bytes.len(), "certificate saved");
        Ok(path)
    }
}
