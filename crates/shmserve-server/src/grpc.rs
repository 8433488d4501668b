use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use shmserve_core::{
    DType, IOName, ModelDirectory, ModelHandle, ServeError, Shape, StatusCode, Tensor, TensorSpec,
    VersionState,
};
use shmserve_proto::shmserve::v1 as pb;
use shmserve_runtime::{FrontEnd, PredictRequest, PredictResponse, Timings};
use tonic::metadata::MetadataMap;
use tonic::{Request, Response, Status};

const SIGNATURE_KEY: &str = "serving_default";
const METADATA_FIELD: &str = "signature_def";
const PREDICT_METHOD: &str = "predict";

pub struct PredictionSvc {
    pub front: FrontEnd,
    pub directory: Arc<dyn ModelDirectory>,
}

pub struct ModelSvc {
    pub front: FrontEnd,
    pub directory: Arc<dyn ModelDirectory>,
}

#[tonic::async_trait]
impl pb::prediction_service_server::PredictionService for PredictionSvc {
    async fn predict(
        &self,
        req: Request<pb::PredictRequest>,
    ) -> std::result::Result<Response<pb::PredictResponse>, Status> {
        let header_timeout = grpc_timeout(req.metadata());
        let req = req.into_inner();
        let (model, version) = parse_model_spec(req.model_spec)?;

        let mut inputs = Vec::with_capacity(req.inputs.len());
        for (name, t) in req.inputs {
            let tensor = tensor_from_proto(t)
                .map_err(|e| Status::invalid_argument(format!("input '{name}': {e:#}")))?;
            inputs.push((IOName(name), tensor));
        }

        let request = PredictRequest {
            model,
            version,
            inputs,
            timeout: tighter(req.timeout_ms.map(Duration::from_millis), header_timeout),
        };
        let response = self.front.predict(request).await.map_err(to_status)?;
        Ok(Response::new(predict_response(response)))
    }

    async fn get_model_metadata(
        &self,
        req: Request<pb::GetModelMetadataRequest>,
    ) -> std::result::Result<Response<pb::GetModelMetadataResponse>, Status> {
        let req = req.into_inner();
        check_metadata_fields(&req.metadata_field)?;
        let (name, version) = parse_model_spec(req.model_spec)?;
        let model = self.directory.resolve(&name, version).map_err(to_status)?;

        let mut signature_def = HashMap::new();
        signature_def.insert(SIGNATURE_KEY.to_string(), signature_def_of(&model));
        Ok(Response::new(pb::GetModelMetadataResponse {
            model_spec: Some(model_spec(&model.name, model.version)),
            signature_def,
        }))
    }
}

#[tonic::async_trait]
impl pb::model_service_server::ModelService for ModelSvc {
    async fn get_model_status(
        &self,
        req: Request<pb::GetModelStatusRequest>,
    ) -> std::result::Result<Response<pb::GetModelStatusResponse>, Status> {
        let (name, version) = parse_model_spec(req.into_inner().model_spec)?;
        let entries = self.directory.statuses(&name, version).map_err(to_status)?;
        Ok(Response::new(pb::GetModelStatusResponse {
            model_version_status: entries
                .into_iter()
                .map(|entry| pb::ModelVersionStatus {
                    version: entry.version as i64,
                    state: to_proto_state(entry.state) as i32,
                })
                .collect(),
        }))
    }

    async fn get_pool_stats(
        &self,
        _req: Request<pb::GetPoolStatsRequest>,
    ) -> std::result::Result<Response<pb::GetPoolStatsResponse>, Status> {
        let front = self.front.clone();
        let stats = tokio::task::spawn_blocking(move || front.pool_stats())
            .await
            .map_err(|e| Status::internal(e.to_string()))?
            .map_err(to_status)?;
        Ok(Response::new(pb::GetPoolStatsResponse {
            free: stats.free,
            acquired: stats.acquired,
            in_flight: stats.in_flight,
            waiting: stats.waiting,
        }))
    }
}

pub fn to_status(e: ServeError) -> Status {
    let message = e.message().to_string();
    match e.code() {
        StatusCode::InvalidArgument => Status::invalid_argument(message),
        StatusCode::NotFound => Status::not_found(message),
        StatusCode::Unavailable => Status::unavailable(message),
        StatusCode::DeadlineExceeded => Status::deadline_exceeded(message),
        StatusCode::Internal => Status::internal(message),
    }
}

/// The client deadline carried in the `grpc-timeout` header, if well formed.
fn grpc_timeout(metadata: &MetadataMap) -> Option<Duration> {
    let raw = metadata.get("grpc-timeout")?.to_str().ok()?;
    // at most eight ASCII digits followed by a one letter unit
    if raw.len() < 2 || raw.len() > 9 {
        return None;
    }
    let (digits, unit) = raw.split_at(raw.len() - 1);
    let value: u64 = digits.parse().ok()?;
    Some(match unit {
        "H" => Duration::from_secs(value.saturating_mul(3600)),
        "M" => Duration::from_secs(value.saturating_mul(60)),
        "S" => Duration::from_secs(value),
        "m" => Duration::from_millis(value),
        "u" => Duration::from_micros(value),
        "n" => Duration::from_nanos(value),
        _ => return None,
    })
}

fn tighter(a: Option<Duration>, b: Option<Duration>) -> Option<Duration> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

fn parse_model_spec(
    spec: Option<pb::ModelSpec>,
) -> std::result::Result<(String, Option<u64>), Status> {
    let spec = spec.ok_or_else(|| Status::invalid_argument("model_spec is required"))?;
    let version = spec
        .version
        .map(|v| {
            u64::try_from(v)
                .map_err(|_| Status::invalid_argument(format!("invalid model version {v}")))
        })
        .transpose()?;
    Ok((spec.name, version))
}

fn check_metadata_fields(fields: &[String]) -> std::result::Result<(), Status> {
    if fields.is_empty() {
        return Err(Status::invalid_argument(format!(
            "metadata_field must name '{METADATA_FIELD}'"
        )));
    }
    match fields.iter().find(|f| f.as_str() != METADATA_FIELD) {
        Some(other) => Err(Status::invalid_argument(format!(
            "metadata field '{other}' is not supported, only '{METADATA_FIELD}' is"
        ))),
        None => Ok(()),
    }
}

fn tensor_from_proto(t: pb::TensorProto) -> Result<Tensor> {
    let dtype = parse_dtype(t.dtype)?;
    let dims = t
        .shape
        .iter()
        .map(|&d| usize::try_from(d).with_context(|| format!("negative dimension {d}")))
        .collect::<Result<Vec<_>>>()?;
    Ok(Tensor::from_bytes(
        dtype,
        Shape::from_slice(&dims),
        Bytes::from(t.content),
    ))
}

fn tensor_to_proto(t: &Tensor) -> pb::TensorProto {
    pb::TensorProto {
        dtype: to_proto_dtype(t.desc.dtype) as i32,
        shape: t.desc.shape.dims().iter().map(|d| *d as i64).collect(),
        content: t.bytes.to_vec(),
    }
}

fn predict_response(response: PredictResponse) -> pb::PredictResponse {
    let PredictResponse {
        model,
        version,
        outputs,
        timings,
    } = response;
    pb::PredictResponse {
        model_spec: Some(model_spec(&model, version)),
        outputs: outputs
            .into_iter()
            .map(|(name, t)| (name.0, tensor_to_proto(&t)))
            .collect(),
        timings: Some(stage_timings(timings)),
    }
}

fn stage_timings(t: Timings) -> pb::StageTimings {
    pb::StageTimings {
        acquire_us: t.acquire_us,
        copy_in_us: t.copy_in_us,
        dispatch_us: t.dispatch_us,
        inference_us: t.inference_us,
        copy_out_us: t.copy_out_us,
        release_us: t.release_us,
    }
}

fn model_spec(name: &str, version: u64) -> pb::ModelSpec {
    pb::ModelSpec {
        name: name.to_string(),
        version: Some(version as i64),
        signature_name: SIGNATURE_KEY.to_string(),
    }
}

fn signature_def_of(model: &ModelHandle) -> pb::SignatureDef {
    let infos = |specs: &[TensorSpec]| {
        specs
            .iter()
            .map(|spec| (spec.name.0.clone(), tensor_info(spec)))
            .collect::<HashMap<_, _>>()
    };
    pb::SignatureDef {
        inputs: infos(&model.spec.inputs),
        outputs: infos(&model.spec.outputs),
        method_name: PREDICT_METHOD.to_string(),
    }
}

fn tensor_info(spec: &TensorSpec) -> pb::TensorInfo {
    pb::TensorInfo {
        name: spec.name.0.clone(),
        dtype: to_proto_dtype(spec.dtype) as i32,
        shape: spec
            .dims
            .iter()
            .map(|d| d.map_or(-1, |d| d as i64))
            .collect(),
    }
}

fn parse_dtype(raw: i32) -> Result<DType> {
    let dtype = pb::DType::try_from(raw).context("unknown dtype enum value")?;
    Ok(match dtype {
        pb::DType::F32 => DType::F32,
        pb::DType::F16 => DType::F16,
        pb::DType::I64 => DType::I64,
        pb::DType::I32 => DType::I32,
        pb::DType::U8 => DType::U8,
        pb::DType::DtypeUnspecified => anyhow::bail!("dtype is unspecified"),
    })
}

fn to_proto_dtype(dtype: DType) -> pb::DType {
    match dtype {
        DType::F32 => pb::DType::F32,
        DType::F16 => pb::DType::F16,
        DType::I64 => pb::DType::I64,
        DType::I32 => pb::DType::I32,
        DType::U8 => pb::DType::U8,
    }
}

fn to_proto_state(state: VersionState) -> pb::model_version_status::State {
    use pb::model_version_status::State;
    match state {
        VersionState::Available => State::Available,
        VersionState::Loading => State::Loading,
        VersionState::Unloading => State::Unloading,
        VersionState::Failed => State::Failed,
    }
}

#[cfg(test)]
mod tests {
    use pb::model_service_server::ModelService;
    use pb::prediction_service_server::PredictionService;
    use shmserve_backend_echo::EchoExecutor;
    use shmserve_runtime::{
        single_model, HandlerPool, InferenceWorker, ModelRegistry, RunningManager, SlotManager,
    };
    use tempfile::TempDir;

    use super::*;

    struct Harness {
        _dir: TempDir,
        manager: RunningManager,
        prediction: PredictionSvc,
        models: ModelSvc,
    }

    fn start() -> anyhow::Result<Harness> {
        let dir = tempfile::tempdir()?;
        let mut config = single_model("echo", DType::F32, &[1, 4], &[1, 4]);
        config.runtime.socket_dir = dir.path().join("sock");
        config.runtime.shm_dir = dir.path().join("shm");
        config.runtime.pool_size = 2;
        config.runtime.handler_threads = 2;
        config.runtime.executors_per_worker = 2;
        config.runtime.request_timeout_ms = 2_000;
        config.runtime.lease_ttl_ms = 10_000;

        let manager = SlotManager::spawn(&config.runtime, config.arena_layout()?)?;
        InferenceWorker::bind(&config, 0, Arc::new(EchoExecutor::new()))?.spawn()?;
        let directory: Arc<dyn ModelDirectory> =
            Arc::new(ModelRegistry::from_config(&config.model_config_list));
        let front = HandlerPool::start(&config, directory.clone())?;
        Ok(Harness {
            _dir: dir,
            manager,
            prediction: PredictionSvc {
                front: front.clone(),
                directory: directory.clone(),
            },
            models: ModelSvc { front, directory },
        })
    }

    fn f32_tensor(values: &[f32], shape: &[i64]) -> pb::TensorProto {
        pb::TensorProto {
            dtype: pb::DType::F32 as i32,
            shape: shape.to_vec(),
            content: values.iter().flat_map(|v| v.to_le_bytes()).collect(),
        }
    }

    fn predict_request(input: pb::TensorProto) -> pb::PredictRequest {
        pb::PredictRequest {
            model_spec: Some(pb::ModelSpec {
                name: "echo".into(),
                version: None,
                signature_name: String::new(),
            }),
            inputs: HashMap::from([("input".to_string(), input)]),
            timeout_ms: None,
        }
    }

    #[tokio::test]
    async fn predict_doubles_input_and_reports_timings() -> anyhow::Result<()> {
        let h = start()?;
        let response = h
            .prediction
            .predict(Request::new(predict_request(f32_tensor(
                &[1.0, 2.0, 3.0, 4.0],
                &[1, 4],
            ))))
            .await?
            .into_inner();

        let output = &response.outputs["output"];
        let values: Vec<f32> = output
            .content
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        assert_eq!(values, vec![2.0, 4.0, 6.0, 8.0]);
        assert_eq!(output.shape, vec![1, 4]);
        assert_eq!(response.model_spec.and_then(|s| s.version), Some(1));
        assert!(response.timings.is_some());

        let stats = h
            .models
            .get_pool_stats(Request::new(pb::GetPoolStatsRequest {}))
            .await?
            .into_inner();
        assert_eq!(stats.free, 2);
        h.manager.shutdown()
    }

    #[tokio::test]
    async fn predict_rejects_wrong_shape_and_negative_dims() -> anyhow::Result<()> {
        let h = start()?;
        let err = h
            .prediction
            .predict(Request::new(predict_request(f32_tensor(
                &[1.0, 2.0, 3.0, 4.0, 5.0],
                &[1, 5],
            ))))
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::InvalidArgument);

        let err = h
            .prediction
            .predict(Request::new(predict_request(f32_tensor(&[], &[-1, 4]))))
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::InvalidArgument);
        assert!(err.message().contains("negative dimension"), "{}", err.message());
        h.manager.shutdown()
    }

    #[tokio::test]
    async fn status_and_metadata_lookups() -> anyhow::Result<()> {
        let h = start()?;
        let spec = |name: &str| {
            Some(pb::ModelSpec {
                name: name.into(),
                version: None,
                signature_name: String::new(),
            })
        };

        let err = h
            .models
            .get_model_status(Request::new(pb::GetModelStatusRequest {
                model_spec: spec("missing"),
            }))
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::NotFound);

        let status = h
            .models
            .get_model_status(Request::new(pb::GetModelStatusRequest {
                model_spec: spec("echo"),
            }))
            .await?
            .into_inner();
        assert_eq!(status.model_version_status.len(), 1);
        assert_eq!(
            status.model_version_status[0].state,
            pb::model_version_status::State::Available as i32
        );

        let metadata = h
            .prediction
            .get_model_metadata(Request::new(pb::GetModelMetadataRequest {
                model_spec: spec("echo"),
                metadata_field: vec![METADATA_FIELD.into()],
            }))
            .await?
            .into_inner();
        let signature = &metadata.signature_def[SIGNATURE_KEY];
        assert_eq!(signature.inputs["input"].shape, vec![1, 4]);
        assert_eq!(signature.outputs["output"].dtype, pb::DType::F32 as i32);

        let err = h
            .prediction
            .get_model_metadata(Request::new(pb::GetModelMetadataRequest {
                model_spec: spec("echo"),
                metadata_field: vec!["labels".into()],
            }))
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::InvalidArgument);
        h.manager.shutdown()
    }

    #[test]
    fn maps_every_error_code() {
        let cases = [
            (ServeError::InvalidArgument("a".into()), tonic::Code::InvalidArgument),
            (ServeError::NotFound("b".into()), tonic::Code::NotFound),
            (ServeError::Unavailable("c".into()), tonic::Code::Unavailable),
            (ServeError::DeadlineExceeded("d".into()), tonic::Code::DeadlineExceeded),
            (ServeError::Internal("e".into()), tonic::Code::Internal),
        ];
        for (err, code) in cases {
            let message = err.message().to_string();
            let status = to_status(err);
            assert_eq!(status.code(), code);
            assert_eq!(status.message(), message);
        }
    }

    #[test]
    fn dynamic_dims_render_as_minus_one() {
        let spec = TensorSpec {
            name: IOName("x".into()),
            dtype: DType::I64,
            dims: vec![None, Some(3)],
        };
        let info = tensor_info(&spec);
        assert_eq!(info.shape, vec![-1, 3]);
        assert_eq!(info.dtype, pb::DType::I64 as i32);
    }

    #[test]
    fn rejects_unspecified_dtype_and_negative_version() {
        assert!(parse_dtype(pb::DType::DtypeUnspecified as i32).is_err());
        assert!(parse_dtype(99).is_err());
        let err = parse_model_spec(Some(pb::ModelSpec {
            name: "echo".into(),
            version: Some(-2),
            signature_name: String::new(),
        }))
        .unwrap_err();
        assert_eq!(err.code(), tonic::Code::InvalidArgument);
        assert!(parse_model_spec(None).is_err());
    }

    #[test]
    fn reads_grpc_timeout_header() {
        let header = |value: &'static str| {
            let mut metadata = MetadataMap::new();
            metadata.insert("grpc-timeout", value.parse().unwrap());
            grpc_timeout(&metadata)
        };
        assert_eq!(header("250m"), Some(Duration::from_millis(250)));
        assert_eq!(header("3S"), Some(Duration::from_secs(3)));
        assert_eq!(header("2M"), Some(Duration::from_secs(120)));
        assert_eq!(header("1H"), Some(Duration::from_secs(3600)));
        assert_eq!(header("1500u"), Some(Duration::from_micros(1500)));
        assert_eq!(header("10n"), Some(Duration::from_nanos(10)));
        assert_eq!(header("5x"), None);
        assert_eq!(header("m"), None);
        assert_eq!(header("123456789m"), None);
        assert_eq!(grpc_timeout(&MetadataMap::new()), None);
    }

    #[test]
    fn shorter_of_body_and_header_timeout_wins() {
        let ms = Duration::from_millis;
        assert_eq!(tighter(Some(ms(500)), Some(ms(200))), Some(ms(200)));
        assert_eq!(tighter(Some(ms(100)), Some(ms(200))), Some(ms(100)));
        assert_eq!(tighter(None, Some(ms(200))), Some(ms(200)));
        assert_eq!(tighter(Some(ms(300)), None), Some(ms(300)));
        assert_eq!(tighter(None, None), None);
    }

    #[tokio::test]
    async fn expired_client_deadline_fails_the_call() -> anyhow::Result<()> {
        let h = start()?;
        let mut request = Request::new(predict_request(f32_tensor(&[1.0, 2.0, 3.0, 4.0], &[1, 4])));
        request
            .metadata_mut()
            .insert("grpc-timeout", "0n".parse().unwrap());
        let err = h.prediction.predict(request).await.unwrap_err();
        assert_eq!(err.code(), tonic::Code::DeadlineExceeded);
        h.manager.shutdown()
    }

    #[test]
    fn metadata_field_must_be_signature_def() {
        assert!(check_metadata_fields(&[METADATA_FIELD.to_string()]).is_ok());
        assert!(check_metadata_fields(&[]).is_err());
        assert!(check_metadata_fields(&[
            METADATA_FIELD.to_string(),
            "other".to_string()
        ])
        .is_err());
    }
}
