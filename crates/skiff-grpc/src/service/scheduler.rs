//! Scheduler service.

use std::collections::BTreeMap;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use skiff::{
    AdaptorResult, Credential, JobStatus, LocalScheduler, Scheduler, StatusError, StatusErrorType,
    adaptor,
};
use tokio_stream::{Stream, StreamExt};
use tonic::{Request, Response, Status, Streaming};

use super::{GatewayState, blocking, required_id};
use crate::convert;
use crate::error::GatewayError;
use crate::forwarder;
use crate::proto::{self, scheduler_service_server::SchedulerService};
use crate::registry::SessionRequest;
use crate::tracker::{OperationKind, OperationRecord};

type SubmitInteractiveJobStream =
    Pin<Box<dyn Stream<Item = Result<proto::SubmitInteractiveJobResponse, Status>> + Send>>;

/// Implementation of the `SchedulerService` gRPC service.
#[derive(Debug, Clone)]
pub struct SchedulerGateway {
    state: Arc<GatewayState>,
}

impl SchedulerGateway {
    /// Create the service over shared gateway state.
    pub fn new(state: Arc<GatewayState>) -> Self {
        Self { state }
    }

    fn session(
        &self,
        scheduler: Option<&proto::Scheduler>,
    ) -> Result<(String, Arc<dyn Scheduler>), Status> {
        let id = required_id(scheduler.map(|s| s.id.as_str()), "scheduler")?;
        let scheduler = self.state.schedulers.get(id)?;
        Ok((id.to_string(), scheduler))
    }

    /// Run `call` against the scheduler named by a request.
    async fn on_scheduler<T, F>(&self, scheduler: Option<&proto::Scheduler>, call: F) -> Result<T, Status>
    where
        T: Send + 'static,
        F: FnOnce(&dyn Scheduler) -> AdaptorResult<T> + Send + 'static,
    {
        let (_, scheduler) = self.session(scheduler)?;
        blocking(move || Ok(call(scheduler.as_ref())?)).await
    }

    fn job(
        &self,
        scheduler: Option<&proto::Scheduler>,
        job: Option<&proto::Job>,
    ) -> Result<(String, Arc<dyn Scheduler>, String), Status> {
        let (owner, scheduler) = self.session(scheduler)?;
        let id = required_id(job.map(|j| j.id.as_str()), "job")?;
        tracing::debug!(scheduler = %owner, job = id, "job call");
        Ok((owner, scheduler, id.to_string()))
    }

    async fn open(&self, request: SessionRequest) -> Result<String, Status> {
        if let Some(id) = self.state.schedulers.find_live(&request) {
            return Err(GatewayError::already_exists(format!(
                "scheduler {id} is already open for this request"
            ))
            .into());
        }
        let scheduler = {
            let request = request.clone();
            blocking(move || {
                Ok(adaptor::create_scheduler(
                    &request.adaptor,
                    &request.location,
                    &request.credential,
                    &request.properties,
                )?)
            })
            .await?
        };
        Ok(self.state.schedulers.put(request, scheduler)?)
    }

    fn register_job(
        &self,
        kind: OperationKind,
        owner: String,
        job_id: &str,
        description: skiff::JobDescription,
    ) {
        self.state.jobs.register(OperationRecord {
            id: job_id.to_string(),
            kind,
            owner,
            external_id: job_id.to_string(),
            request: description,
        });
    }
}

fn wait_timeout(timeout: u64) -> Duration {
    Duration::from_millis(timeout)
}

#[tonic::async_trait]
impl SchedulerService for SchedulerGateway {
    type SubmitInteractiveJobStream = SubmitInteractiveJobStream;

    async fn get_adaptor_descriptions(
        &self,
        _request: Request<proto::Empty>,
    ) -> Result<Response<proto::SchedulerAdaptorDescriptions>, Status> {
        let descriptions = adaptor::scheduler_adaptor_descriptions()
            .iter()
            .map(convert::scheduler_description_message)
            .collect();
        Ok(Response::new(proto::SchedulerAdaptorDescriptions { descriptions }))
    }

    async fn get_adaptor_names(
        &self,
        _request: Request<proto::Empty>,
    ) -> Result<Response<proto::AdaptorNames>, Status> {
        Ok(Response::new(proto::AdaptorNames {
            name: adaptor::scheduler_adaptor_names(),
        }))
    }

    async fn get_adaptor_description(
        &self,
        request: Request<proto::AdaptorName>,
    ) -> Result<Response<proto::SchedulerAdaptorDescription>, Status> {
        let name = request.into_inner().name;
        let description =
            adaptor::scheduler_adaptor_description(&name).map_err(GatewayError::from)?;
        Ok(Response::new(convert::scheduler_description_message(
            &description,
        )))
    }

    async fn create(
        &self,
        request: Request<proto::CreateSchedulerRequest>,
    ) -> Result<Response<proto::Scheduler>, Status> {
        let request = convert::scheduler_request(request.into_inner())?;
        tracing::debug!(adaptor = %request.adaptor, location = %request.location, "creating scheduler");
        let id = self.open(request.clone()).await?;
        Ok(Response::new(convert::scheduler_message(&id, &request)))
    }

    async fn local_scheduler(
        &self,
        _request: Request<proto::Empty>,
    ) -> Result<Response<proto::Scheduler>, Status> {
        let request = SessionRequest {
            adaptor: LocalScheduler::ADAPTOR_NAME.to_string(),
            location: String::new(),
            credential: Credential::default(),
            properties: BTreeMap::new(),
        };
        let id = match self.state.schedulers.find_live(&request) {
            Some(id) => id,
            None => {
                let scheduler = blocking(|| {
                    let scheduler = LocalScheduler::open("", &Credential::default(), &BTreeMap::new())?;
                    Ok(Arc::new(scheduler) as Arc<dyn Scheduler>)
                })
                .await?;
                self.state.schedulers.put_or_reuse(request.clone(), scheduler)
            }
        };
        Ok(Response::new(convert::scheduler_message(&id, &request)))
    }

    async fn list_schedulers(
        &self,
        _request: Request<proto::Empty>,
    ) -> Result<Response<proto::Schedulers>, Status> {
        let schedulers = self
            .state
            .schedulers
            .list()
            .iter()
            .map(|(id, request)| convert::scheduler_message(id, request))
            .collect();
        Ok(Response::new(proto::Schedulers { schedulers }))
    }

    async fn close(&self, request: Request<proto::Scheduler>) -> Result<Response<proto::Empty>, Status> {
        let id = required_id(Some(request.get_ref().id.as_str()), "scheduler")?.to_string();
        let state = Arc::clone(&self.state);
        blocking(move || state.close_scheduler(&id)).await?;
        Ok(Response::new(proto::Empty {}))
    }

    async fn is_open(&self, request: Request<proto::Scheduler>) -> Result<Response<proto::Is>, Status> {
        let (_, scheduler) = self.session(Some(request.get_ref()))?;
        Ok(Response::new(proto::Is {
            value: scheduler.is_open(),
        }))
    }

    async fn get_adaptor_name(
        &self,
        request: Request<proto::Scheduler>,
    ) -> Result<Response<proto::AdaptorName>, Status> {
        let (_, scheduler) = self.session(Some(request.get_ref()))?;
        Ok(Response::new(proto::AdaptorName {
            name: scheduler.adaptor_name().to_string(),
        }))
    }

    async fn get_location(
        &self,
        request: Request<proto::Scheduler>,
    ) -> Result<Response<proto::Location>, Status> {
        let (_, scheduler) = self.session(Some(request.get_ref()))?;
        Ok(Response::new(proto::Location {
            location: scheduler.location().to_string(),
        }))
    }

    async fn get_properties(
        &self,
        request: Request<proto::Scheduler>,
    ) -> Result<Response<proto::Properties>, Status> {
        let (_, scheduler) = self.session(Some(request.get_ref()))?;
        Ok(Response::new(convert::properties_message(
            scheduler.properties(),
        )))
    }

    async fn get_default_queue_name(
        &self,
        request: Request<proto::Scheduler>,
    ) -> Result<Response<proto::Queue>, Status> {
        let name = self
            .on_scheduler(Some(request.get_ref()), |s| s.default_queue_name())
            .await?;
        Ok(Response::new(proto::Queue { name }))
    }

    async fn get_queue_names(
        &self,
        request: Request<proto::Scheduler>,
    ) -> Result<Response<proto::Queues>, Status> {
        let name = self
            .on_scheduler(Some(request.get_ref()), |s| s.queue_names())
            .await?;
        Ok(Response::new(proto::Queues { name }))
    }

    async fn get_queue_status(
        &self,
        request: Request<proto::GetQueueStatusRequest>,
    ) -> Result<Response<proto::QueueStatus>, Status> {
        let request = request.into_inner();
        let handle = request
            .scheduler
            .ok_or_else(|| Status::invalid_argument("scheduler is required"))?;
        let queue = request.queue;
        let status = self
            .on_scheduler(Some(&handle), move |s| s.queue_status(&queue))
            .await?;
        Ok(Response::new(convert::queue_status_message(&handle, &status)))
    }

    async fn get_queue_statuses(
        &self,
        request: Request<proto::SchedulerAndQueues>,
    ) -> Result<Response<proto::QueueStatuses>, Status> {
        let request = request.into_inner();
        let handle = request
            .scheduler
            .ok_or_else(|| Status::invalid_argument("scheduler is required"))?;
        let queues = request.queues;
        let statuses = self
            .on_scheduler(Some(&handle), move |s| s.queue_statuses(&queues))
            .await?;
        Ok(Response::new(proto::QueueStatuses {
            statuses: statuses
                .iter()
                .map(|status| convert::queue_status_message(&handle, status))
                .collect(),
        }))
    }

    async fn get_jobs(
        &self,
        request: Request<proto::SchedulerAndQueues>,
    ) -> Result<Response<proto::Jobs>, Status> {
        let request = request.into_inner();
        let queues = request.queues;
        let ids = self
            .on_scheduler(request.scheduler.as_ref(), move |s| s.jobs(&queues))
            .await?;
        Ok(Response::new(proto::Jobs {
            jobs: ids.into_iter().map(|id| proto::Job { id }).collect(),
        }))
    }

    async fn submit_batch_job(
        &self,
        request: Request<proto::SubmitBatchJobRequest>,
    ) -> Result<Response<proto::Job>, Status> {
        let request = request.into_inner();
        let (owner, scheduler) = self.session(request.scheduler.as_ref())?;
        let description = convert::job_description(
            request
                .description
                .ok_or_else(|| Status::invalid_argument("description is required"))?,
        );
        tracing::debug!(scheduler = %owner, executable = %description.executable, "submitting batch job");
        let id = {
            let description = description.clone();
            blocking(move || Ok(scheduler.submit_batch_job(&description)?)).await?
        };
        self.register_job(OperationKind::BatchJob, owner, &id, description);
        Ok(Response::new(proto::Job { id }))
    }

    async fn submit_interactive_job(
        &self,
        request: Request<Streaming<proto::SubmitInteractiveJobRequest>>,
    ) -> Result<Response<Self::SubmitInteractiveJobStream>, Status> {
        let mut inbound = request.into_inner();
        let first = match inbound.next().await {
            Some(Ok(first)) => first,
            Some(Err(status)) => return Err(status),
            None => {
                return Err(Status::invalid_argument(
                    "stream closed before the job description",
                ));
            }
        };
        let (owner, scheduler) = self.session(first.scheduler.as_ref())?;
        let description = convert::job_description(
            first
                .description
                .ok_or_else(|| Status::invalid_argument("first message must carry a description"))?,
        );
        tracing::debug!(scheduler = %owner, executable = %description.executable, "submitting interactive job");

        let (job_id, responses) = forwarder::forward(
            scheduler,
            description.clone(),
            first.stdin,
            inbound,
            self.state.config.stream_chunk_size,
        )
        .await?;
        self.register_job(OperationKind::InteractiveJob, owner, &job_id, description);
        Ok(Response::new(
            Box::pin(responses) as Self::SubmitInteractiveJobStream
        ))
    }

    async fn get_job_status(
        &self,
        request: Request<proto::JobRequest>,
    ) -> Result<Response<proto::JobStatus>, Status> {
        let request = request.into_inner();
        let (owner, scheduler, id) = self.job(request.scheduler.as_ref(), request.job.as_ref())?;
        let state = Arc::clone(&self.state);
        let status = blocking(move || state.jobs.poll(scheduler.as_ref(), &owner, &id)).await?;
        Ok(Response::new(convert::job_status_message(&status)))
    }

    async fn get_job_statuses(
        &self,
        request: Request<proto::JobsRequest>,
    ) -> Result<Response<proto::JobStatuses>, Status> {
        let request = request.into_inner();
        let (owner, scheduler) = self.session(request.scheduler.as_ref())?;
        let ids: Vec<String> = request.jobs.into_iter().map(|job| job.id).collect();
        let state = Arc::clone(&self.state);
        let statuses = blocking(move || {
            // Only tracked jobs reach the session; the rest are answered
            // here so a deleted job can never resolve to a live one.
            let lookups: Vec<_> = ids.iter().map(|id| state.jobs.find(&owner, id)).collect();
            let external: Vec<String> = lookups
                .iter()
                .filter_map(|lookup| lookup.as_ref().ok())
                .map(|record| record.external_id.clone())
                .collect();
            let mut queried = scheduler.job_statuses(&external).into_iter();

            let mut statuses = Vec::with_capacity(ids.len());
            for (id, lookup) in ids.iter().zip(lookups) {
                let status = match lookup {
                    Ok(_) => match queried.next() {
                        Some(status) => status,
                        None => {
                            return Err(GatewayError::internal(format!(
                                "scheduler {owner} returned too few job statuses"
                            )));
                        }
                    },
                    Err(err) => untracked_status(id, err),
                };
                // The session reports vanished jobs inside their status;
                // stop tracking them so later calls see NOT_FOUND.
                if is_unknown(&status) {
                    state.jobs.forget(&owner, id);
                }
                statuses.push(status);
            }
            Ok(statuses)
        })
        .await?;
        Ok(Response::new(proto::JobStatuses {
            statuses: statuses.iter().map(convert::job_status_message).collect(),
        }))
    }

    async fn cancel_job(
        &self,
        request: Request<proto::JobRequest>,
    ) -> Result<Response<proto::JobStatus>, Status> {
        let request = request.into_inner();
        let (owner, scheduler, id) = self.job(request.scheduler.as_ref(), request.job.as_ref())?;
        let state = Arc::clone(&self.state);
        let status = blocking(move || state.jobs.cancel(scheduler.as_ref(), &owner, &id)).await?;
        Ok(Response::new(convert::job_status_message(&status)))
    }

    async fn delete_job(&self, request: Request<proto::JobRequest>) -> Result<Response<proto::Empty>, Status> {
        let request = request.into_inner();
        let (owner, scheduler, id) = self.job(request.scheduler.as_ref(), request.job.as_ref())?;
        let state = Arc::clone(&self.state);
        blocking(move || state.jobs.delete_if_done(scheduler.as_ref(), &owner, &id)).await?;
        Ok(Response::new(proto::Empty {}))
    }

    async fn wait_until_done(
        &self,
        request: Request<proto::WaitRequest>,
    ) -> Result<Response<proto::JobStatus>, Status> {
        let request = request.into_inner();
        let (owner, scheduler, id) = self.job(request.scheduler.as_ref(), request.job.as_ref())?;
        let timeout = wait_timeout(request.timeout);
        let state = Arc::clone(&self.state);
        let status = blocking(move || {
            state.jobs.with_external_id(&owner, &id, |job_id| {
                scheduler.wait_until_done(job_id, timeout)
            })
        })
        .await?;
        Ok(Response::new(convert::job_status_message(&status)))
    }

    async fn wait_until_running(
        &self,
        request: Request<proto::WaitRequest>,
    ) -> Result<Response<proto::JobStatus>, Status> {
        let request = request.into_inner();
        let (owner, scheduler, id) = self.job(request.scheduler.as_ref(), request.job.as_ref())?;
        let timeout = wait_timeout(request.timeout);
        let state = Arc::clone(&self.state);
        let status = blocking(move || {
            state.jobs.with_external_id(&owner, &id, |job_id| {
                scheduler.wait_until_running(job_id, timeout)
            })
        })
        .await?;
        Ok(Response::new(convert::job_status_message(&status)))
    }

    async fn get_file_system(
        &self,
        request: Request<proto::Scheduler>,
    ) -> Result<Response<proto::FileSystem>, Status> {
        let (id, scheduler) = self.session(Some(request.get_ref()))?;
        let credential = self.state.schedulers.request(&id)?.credential;
        let fs = blocking(move || Ok(scheduler.file_system()?)).await?;
        let request = SessionRequest {
            adaptor: fs.adaptor_name().to_string(),
            location: fs.location().to_string(),
            credential,
            properties: fs.properties().clone(),
        };
        let fs_id = self.state.share_file_system(&id, request.clone(), fs);
        tracing::debug!(scheduler = %id, filesystem = %fs_id, "registered scheduler file system");
        Ok(Response::new(convert::file_system_message(&fs_id, &request)))
    }
}

/// Status reported for a job id this gateway does not track.
fn untracked_status(id: &str, err: GatewayError) -> JobStatus {
    JobStatus {
        job_id: id.to_string(),
        state: "UNKNOWN".to_string(),
        running: false,
        done: false,
        exit_code: None,
        error: Some(StatusError {
            error_type: StatusErrorType::NotFound,
            message: err.message,
        }),
        scheduler_specific_information: BTreeMap::new(),
    }
}

fn is_unknown(status: &JobStatus) -> bool {
    status
        .error
        .as_ref()
        .is_some_and(|e| e.error_type == StatusErrorType::NotFound)
}
