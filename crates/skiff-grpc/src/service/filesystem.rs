//! File system service.

use std::collections::BTreeMap;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use skiff::{AdaptorResult, Credential, FileSystem, LocalFileSystem, RemotePath, adaptor};
use tokio_stream::Stream;
use tonic::{Request, Response, Status, Streaming};

use super::{CopyParameters, GatewayState, blocking, required_id};
use crate::convert;
use crate::deadline;
use crate::error::{ErrorKind, GatewayError};
use crate::proto::{self, file_system_service_server::FileSystemService};
use crate::registry::SessionRequest;
use crate::tracker::{OperationKind, OperationRecord};
use crate::transfer;

type ListStream = Pin<Box<dyn Stream<Item = Result<proto::PathAttributes, Status>> + Send>>;
type ReadFromFileStream =
    Pin<Box<dyn Stream<Item = Result<proto::ReadFromFileResponse, Status>> + Send>>;

/// Implementation of the `FileSystemService` gRPC service.
#[derive(Debug, Clone)]
pub struct FileSystemGateway {
    state: Arc<GatewayState>,
}

impl FileSystemGateway {
    /// Create the service over shared gateway state.
    pub fn new(state: Arc<GatewayState>) -> Self {
        Self { state }
    }

    fn session(
        &self,
        filesystem: Option<&proto::FileSystem>,
    ) -> Result<(String, Arc<dyn FileSystem>), Status> {
        let id = required_id(filesystem.map(|f| f.id.as_str()), "filesystem")?;
        let fs = self.state.file_systems.get(id)?;
        Ok((id.to_string(), fs))
    }

    fn target(
        &self,
        filesystem: Option<&proto::FileSystem>,
        path: Option<&proto::Path>,
    ) -> Result<(Arc<dyn FileSystem>, RemotePath), Status> {
        let (id, fs) = self.session(filesystem)?;
        let path = convert::required_path(path, "path")?;
        tracing::debug!(filesystem = %id, %path, "file system call");
        Ok((fs, path))
    }

    /// Run `call` against the path named by a request.
    async fn on_path<T, F>(&self, request: &proto::PathRequest, call: F) -> Result<T, Status>
    where
        T: Send + 'static,
        F: FnOnce(&dyn FileSystem, &RemotePath) -> AdaptorResult<T> + Send + 'static,
    {
        let (fs, path) = self.target(request.filesystem.as_ref(), request.path.as_ref())?;
        blocking(move || Ok(call(fs.as_ref(), &path)?)).await
    }

    async fn open(&self, request: SessionRequest) -> Result<String, Status> {
        if let Some(id) = self.state.file_systems.find_live(&request) {
            return Err(GatewayError::already_exists(format!(
                "file system {id} is already open for this request"
            ))
            .into());
        }
        let fs = {
            let request = request.clone();
            blocking(move || {
                Ok(adaptor::create_file_system(
                    &request.adaptor,
                    &request.location,
                    &request.credential,
                    &request.properties,
                )?)
            })
            .await?
        };
        Ok(self.state.file_systems.put(request, fs)?)
    }

    fn copy_operation(
        &self,
        filesystem: Option<&proto::FileSystem>,
        operation: Option<&proto::CopyOperation>,
    ) -> Result<(String, Arc<dyn FileSystem>, String), Status> {
        let (owner, fs) = self.session(filesystem)?;
        let id = required_id(operation.map(|o| o.id.as_str()), "copy_operation")?;
        Ok((owner, fs, id.to_string()))
    }
}

#[tonic::async_trait]
impl FileSystemService for FileSystemGateway {
    type ListStream = ListStream;
    type ReadFromFileStream = ReadFromFileStream;

    async fn get_adaptor_descriptions(
        &self,
        _request: Request<proto::Empty>,
    ) -> Result<Response<proto::FileSystemAdaptorDescriptions>, Status> {
        let descriptions = adaptor::file_system_adaptor_descriptions()
            .iter()
            .map(convert::file_system_description_message)
            .collect();
        Ok(Response::new(proto::FileSystemAdaptorDescriptions { descriptions }))
    }

    async fn get_adaptor_names(
        &self,
        _request: Request<proto::Empty>,
    ) -> Result<Response<proto::AdaptorNames>, Status> {
        Ok(Response::new(proto::AdaptorNames {
            name: adaptor::file_system_adaptor_names(),
        }))
    }

    async fn get_adaptor_description(
        &self,
        request: Request<proto::AdaptorName>,
    ) -> Result<Response<proto::FileSystemAdaptorDescription>, Status> {
        let name = request.into_inner().name;
        let description =
            adaptor::file_system_adaptor_description(&name).map_err(GatewayError::from)?;
        Ok(Response::new(convert::file_system_description_message(
            &description,
        )))
    }

    async fn create(
        &self,
        request: Request<proto::CreateFileSystemRequest>,
    ) -> Result<Response<proto::FileSystem>, Status> {
        let request = convert::file_system_request(request.into_inner())?;
        tracing::debug!(adaptor = %request.adaptor, location = %request.location, "creating file system");
        let id = self.open(request.clone()).await?;
        Ok(Response::new(convert::file_system_message(&id, &request)))
    }

    async fn local_file_systems(
        &self,
        _request: Request<proto::Empty>,
    ) -> Result<Response<proto::FileSystems>, Status> {
        let mut filesystems = Vec::new();
        for root in LocalFileSystem::roots() {
            let request = SessionRequest {
                adaptor: LocalFileSystem::ADAPTOR_NAME.to_string(),
                location: root,
                credential: Credential::default(),
                properties: BTreeMap::new(),
            };
            let id = match self.state.file_systems.find_live(&request) {
                Some(id) => id,
                None => {
                    let location = request.location.clone();
                    let fs = blocking(move || {
                        let fs = LocalFileSystem::open(&location, &Credential::default(), &BTreeMap::new())?;
                        Ok(Arc::new(fs) as Arc<dyn FileSystem>)
                    })
                    .await?;
                    self.state.file_systems.put_or_reuse(request.clone(), fs)
                }
            };
            filesystems.push(convert::file_system_message(&id, &request));
        }
        Ok(Response::new(proto::FileSystems { filesystems }))
    }

    async fn list_file_systems(
        &self,
        _request: Request<proto::Empty>,
    ) -> Result<Response<proto::FileSystems>, Status> {
        let filesystems = self
            .state
            .file_systems
            .list()
            .iter()
            .map(|(id, request)| convert::file_system_message(id, request))
            .collect();
        Ok(Response::new(proto::FileSystems { filesystems }))
    }

    async fn close(&self, request: Request<proto::FileSystem>) -> Result<Response<proto::Empty>, Status> {
        let request = request.into_inner();
        let (id, fs) = self.session(Some(&request))?;
        let state = Arc::clone(&self.state);
        blocking(move || {
            for record in state.copies.forget_owner(&id) {
                if let Err(err) = fs.cancel_copy(&record.external_id) {
                    tracing::debug!(filesystem = %id, copy = %record.id, error = %err, "copy not cancelled on close");
                }
            }
            state.file_systems.close(&id)
        })
        .await?;
        Ok(Response::new(proto::Empty {}))
    }

    async fn is_open(&self, request: Request<proto::FileSystem>) -> Result<Response<proto::Is>, Status> {
        let (_, fs) = self.session(Some(request.get_ref()))?;
        Ok(Response::new(proto::Is {
            value: fs.is_open(),
        }))
    }

    async fn get_adaptor_name(
        &self,
        request: Request<proto::FileSystem>,
    ) -> Result<Response<proto::AdaptorName>, Status> {
        let (_, fs) = self.session(Some(request.get_ref()))?;
        Ok(Response::new(proto::AdaptorName {
            name: fs.adaptor_name().to_string(),
        }))
    }

    async fn get_location(
        &self,
        request: Request<proto::FileSystem>,
    ) -> Result<Response<proto::Location>, Status> {
        let (_, fs) = self.session(Some(request.get_ref()))?;
        Ok(Response::new(proto::Location {
            location: fs.location().to_string(),
        }))
    }

    async fn get_properties(
        &self,
        request: Request<proto::FileSystem>,
    ) -> Result<Response<proto::Properties>, Status> {
        let (_, fs) = self.session(Some(request.get_ref()))?;
        Ok(Response::new(convert::properties_message(fs.properties())))
    }

    async fn get_working_directory(
        &self,
        request: Request<proto::FileSystem>,
    ) -> Result<Response<proto::Path>, Status> {
        let (_, fs) = self.session(Some(request.get_ref()))?;
        let directory = blocking(move || Ok(fs.working_directory())).await?;
        Ok(Response::new(convert::path_message(&directory)))
    }

    async fn set_working_directory(
        &self,
        request: Request<proto::PathRequest>,
    ) -> Result<Response<proto::Empty>, Status> {
        self.on_path(request.get_ref(), |fs, path| fs.set_working_directory(path))
            .await?;
        Ok(Response::new(proto::Empty {}))
    }

    async fn exists(&self, request: Request<proto::PathRequest>) -> Result<Response<proto::Is>, Status> {
        let value = self
            .on_path(request.get_ref(), |fs, path| fs.exists(path))
            .await?;
        Ok(Response::new(proto::Is { value }))
    }

    async fn create_directory(
        &self,
        request: Request<proto::PathRequest>,
    ) -> Result<Response<proto::Empty>, Status> {
        self.on_path(request.get_ref(), |fs, path| fs.create_directory(path))
            .await?;
        Ok(Response::new(proto::Empty {}))
    }

    async fn create_directories(
        &self,
        request: Request<proto::PathRequest>,
    ) -> Result<Response<proto::Empty>, Status> {
        self.on_path(request.get_ref(), |fs, path| fs.create_directories(path))
            .await?;
        Ok(Response::new(proto::Empty {}))
    }

    async fn create_file(
        &self,
        request: Request<proto::PathRequest>,
    ) -> Result<Response<proto::Empty>, Status> {
        self.on_path(request.get_ref(), |fs, path| fs.create_file(path))
            .await?;
        Ok(Response::new(proto::Empty {}))
    }

    async fn create_symbolic_link(
        &self,
        request: Request<proto::CreateSymbolicLinkRequest>,
    ) -> Result<Response<proto::Empty>, Status> {
        let request = request.into_inner();
        let (fs, link) = self.target(request.filesystem.as_ref(), request.link.as_ref())?;
        let target = convert::required_path(request.target.as_ref(), "target")?;
        blocking(move || Ok(fs.create_symbolic_link(&link, &target)?)).await?;
        Ok(Response::new(proto::Empty {}))
    }

    async fn read_symbolic_link(
        &self,
        request: Request<proto::PathRequest>,
    ) -> Result<Response<proto::Path>, Status> {
        let target = self
            .on_path(request.get_ref(), |fs, path| fs.read_symbolic_link(path))
            .await?;
        Ok(Response::new(convert::path_message(&target)))
    }

    async fn delete(&self, request: Request<proto::DeleteRequest>) -> Result<Response<proto::Empty>, Status> {
        let request = request.into_inner();
        let (fs, path) = self.target(request.filesystem.as_ref(), request.path.as_ref())?;
        let recursive = request.recursive;
        blocking(move || Ok(fs.delete(&path, recursive)?)).await?;
        Ok(Response::new(proto::Empty {}))
    }

    async fn rename(&self, request: Request<proto::RenameRequest>) -> Result<Response<proto::Empty>, Status> {
        let request = request.into_inner();
        let (fs, source) = self.target(request.filesystem.as_ref(), request.source.as_ref())?;
        let target = convert::required_path(request.target.as_ref(), "target")?;
        blocking(move || Ok(fs.rename(&source, &target)?)).await?;
        Ok(Response::new(proto::Empty {}))
    }

    async fn get_attributes(
        &self,
        request: Request<proto::PathRequest>,
    ) -> Result<Response<proto::PathAttributes>, Status> {
        let attributes = self
            .on_path(request.get_ref(), |fs, path| fs.get_attributes(path))
            .await?;
        Ok(Response::new(convert::attributes_message(&attributes)))
    }

    async fn list(
        &self,
        request: Request<proto::ListRequest>,
    ) -> Result<Response<Self::ListStream>, Status> {
        let request = request.into_inner();
        let (fs, dir) = self.target(request.filesystem.as_ref(), request.dir.as_ref())?;
        let recursive = request.recursive;
        let entries = blocking(move || Ok(fs.list(&dir, recursive)?)).await?;
        let stream = tokio_stream::iter(
            entries
                .into_iter()
                .map(|attributes| Ok(convert::attributes_message(&attributes))),
        );
        Ok(Response::new(Box::pin(stream) as Self::ListStream))
    }

    async fn set_posix_file_permissions(
        &self,
        request: Request<proto::SetPosixFilePermissionsRequest>,
    ) -> Result<Response<proto::Empty>, Status> {
        let request = request.into_inner();
        let (fs, path) = self.target(request.filesystem.as_ref(), request.path.as_ref())?;
        let permissions = convert::permissions(&request.permissions)?;
        blocking(move || Ok(fs.set_posix_file_permissions(&path, &permissions)?)).await?;
        Ok(Response::new(proto::Empty {}))
    }

    async fn read_from_file(
        &self,
        request: Request<proto::PathRequest>,
    ) -> Result<Response<Self::ReadFromFileStream>, Status> {
        let deadline = deadline::from_metadata(request.metadata());
        let request = request.into_inner();
        let (fs, path) = self.target(request.filesystem.as_ref(), request.path.as_ref())?;
        let chunks =
            transfer::send_file(fs, path, self.state.config.read_chunk_size, deadline).await?;
        Ok(Response::new(Box::pin(chunks) as Self::ReadFromFileStream))
    }

    async fn write_to_file(
        &self,
        request: Request<Streaming<proto::WriteToFileRequest>>,
    ) -> Result<Response<proto::Empty>, Status> {
        let deadline = deadline::from_metadata(request.metadata());
        transfer::receive_file(&self.state.file_systems, request.into_inner(), deadline).await?;
        Ok(Response::new(proto::Empty {}))
    }

    async fn append_to_file(
        &self,
        request: Request<Streaming<proto::AppendToFileRequest>>,
    ) -> Result<Response<proto::Empty>, Status> {
        let deadline = deadline::from_metadata(request.metadata());
        transfer::receive_file(&self.state.file_systems, request.into_inner(), deadline).await?;
        Ok(Response::new(proto::Empty {}))
    }

    async fn copy(
        &self,
        request: Request<proto::CopyRequest>,
    ) -> Result<Response<proto::CopyOperation>, Status> {
        let request = request.into_inner();
        let (owner, fs) = self.session(request.filesystem.as_ref())?;
        let source = convert::required_path(request.source.as_ref(), "source")?;
        let destination = convert::required_path(request.destination.as_ref(), "destination")?;
        let (destination_filesystem, target_fs) = match &request.destination_filesystem {
            Some(target) if !target.id.is_empty() => self.session(Some(target))?,
            _ => (owner.clone(), Arc::clone(&fs)),
        };
        let mode = convert::copy_mode(request.mode)?;
        let recursive = request.recursive;
        tracing::debug!(filesystem = %owner, %source, %destination, ?mode, "starting copy");

        let external_id = {
            let (source, destination) = (source.clone(), destination.clone());
            blocking(move || Ok(fs.copy(&source, target_fs, &destination, mode, recursive)?)).await?
        };
        let id = uuid::Uuid::new_v4().to_string();
        self.state.copies.register(OperationRecord {
            id: id.clone(),
            kind: OperationKind::Transfer,
            owner,
            external_id,
            request: CopyParameters {
                source,
                destination_filesystem,
                destination,
                mode,
                recursive,
            },
        });
        Ok(Response::new(proto::CopyOperation { id }))
    }

    async fn get_status(
        &self,
        request: Request<proto::CopyOperationRequest>,
    ) -> Result<Response<proto::CopyStatus>, Status> {
        let request = request.into_inner();
        let (owner, fs, id) =
            self.copy_operation(request.filesystem.as_ref(), request.copy_operation.as_ref())?;
        let state = Arc::clone(&self.state);
        let operation = id.clone();
        let status = blocking(move || state.copies.poll(fs.as_ref(), &owner, &operation)).await?;
        Ok(Response::new(convert::copy_status_message(&id, &status)))
    }

    async fn cancel(
        &self,
        request: Request<proto::CopyOperationRequest>,
    ) -> Result<Response<proto::CopyStatus>, Status> {
        let request = request.into_inner();
        let (owner, fs, id) =
            self.copy_operation(request.filesystem.as_ref(), request.copy_operation.as_ref())?;
        let state = Arc::clone(&self.state);
        let operation = id.clone();
        let status = blocking(move || state.copies.cancel(fs.as_ref(), &owner, &operation)).await?;
        Ok(Response::new(convert::copy_status_message(&id, &status)))
    }

    async fn wait_until_done(
        &self,
        request: Request<proto::WaitUntilDoneRequest>,
    ) -> Result<Response<proto::CopyStatus>, Status> {
        let request = request.into_inner();
        let (owner, fs, id) =
            self.copy_operation(request.filesystem.as_ref(), request.copy_operation.as_ref())?;
        let timeout = Duration::from_millis(request.timeout);
        let state = Arc::clone(&self.state);
        let operation = id.clone();
        let status = blocking(move || {
            state.copies.with_external_id(&owner, &operation, |copy_id| {
                fs.wait_until_copy_done(copy_id, timeout)
            })
        })
        .await?;
        Ok(Response::new(convert::copy_status_message(&id, &status)))
    }

    async fn list_background_copy_statuses(
        &self,
        request: Request<proto::FileSystem>,
    ) -> Result<Response<proto::CopyStatuses>, Status> {
        let (owner, fs) = self.session(Some(request.get_ref()))?;
        let state = Arc::clone(&self.state);
        let statuses = blocking(move || {
            let mut statuses = Vec::new();
            for record in state.copies.list(&owner) {
                match state.copies.poll(fs.as_ref(), &owner, &record.id) {
                    Ok(status) => statuses.push(convert::copy_status_message(&record.id, &status)),
                    // Forgotten by the session since it was listed.
                    Err(err) if err.kind == ErrorKind::NotFound => {}
                    Err(err) => return Err(err),
                }
            }
            Ok(statuses)
        })
        .await?;
        Ok(Response::new(proto::CopyStatuses { statuses }))
    }

    async fn delete_background_copy(
        &self,
        request: Request<proto::CopyOperationRequest>,
    ) -> Result<Response<proto::Empty>, Status> {
        let request = request.into_inner();
        let (owner, fs, id) =
            self.copy_operation(request.filesystem.as_ref(), request.copy_operation.as_ref())?;
        let state = Arc::clone(&self.state);
        blocking(move || state.copies.delete_if_done(fs.as_ref(), &owner, &id)).await?;
        Ok(Response::new(proto::Empty {}))
    }
}
