//! Shared fixtures for controller integration tests

#![allow(dead_code)]

use std::io::{Cursor, Write};
use std::sync::Arc;
use std::time::Duration;

use simplane_common::{LimitsPatch, Tenant};
use simplane_controller::{ControlPlane, ControlPlaneSettings, SubmitRequest};
use simplane_orchestrator::FakeOrchestrator;
use simplane_store::MemoryStore;
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

pub const ADMIN_KEY: &str = "test-admin-key";

pub struct Harness {
    pub plane: ControlPlane,
    pub store: Arc<MemoryStore>,
    pub fake: Arc<FakeOrchestrator>,
}

pub fn settings() -> ControlPlaneSettings {
    let mut settings = ControlPlaneSettings {
        admin_key: Some(ADMIN_KEY.to_string()),
        ..Default::default()
    };
    settings.reconciler.call_timeout = Duration::from_millis(200);
    settings.admission.submit_timeout = Duration::from_millis(500);
    settings
}

pub fn harness() -> Harness {
    harness_with(settings())
}

pub fn harness_with(settings: ControlPlaneSettings) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let fake = Arc::new(FakeOrchestrator::new());
    let plane = ControlPlane::new(store.clone(), fake.clone(), settings);
    Harness { plane, store, fake }
}

impl Harness {
    pub async fn tenant(&self, tenant_id: &str, max_concurrent_jobs: u32) -> Tenant {
        self.plane
            .tenants
            .register(
                tenant_id,
                &LimitsPatch {
                    max_concurrent_jobs: Some(max_concurrent_jobs),
                    ..Default::default()
                },
            )
            .await
            .expect("registration")
            .tenant
    }
}

pub fn request(scenario: &str) -> SubmitRequest {
    SubmitRequest {
        scenario_id: scenario.to_string(),
        cpu_request: 2,
        memory_gi: 4,
        ..Default::default()
    }
}

pub fn archive(entries: &[(&str, &str)]) -> Vec<u8> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    for (name, contents) in entries {
        writer
            .start_file(*name, SimpleFileOptions::default())
            .expect("start zip entry");
        writer
            .write_all(contents.as_bytes())
            .expect("write zip entry");
    }
    writer.finish().expect("finish zip").into_inner()
}
