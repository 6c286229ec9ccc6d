//! Object manager: fetch and store mapped objects on one remote device.

use std::any::type_name;
use std::sync::Arc;

use intairact_core::{Device, MappingError, Method, ObjectMapper, Request, Response};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Error;
use crate::transport::HttpClient;

/// Bound to one device. Objects travel in their mapped form; paths come from `route_type`
/// patterns unless given explicitly.
pub struct ObjectManager {
    device: Device,
    client: HttpClient,
    mapper: Arc<ObjectMapper>,
}

impl ObjectManager {
    pub(crate) fn new(device: Device, client: HttpClient, mapper: Arc<ObjectMapper>) -> Self {
        Self {
            device,
            client,
            mapper,
        }
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn resource_path_for<T: Serialize + 'static>(&self, object: &T) -> Result<String, Error> {
        Ok(self.mapper.resource_path_for(object)?)
    }

    /// GET `path` and decode one `T` from the response.
    pub async fn get<T: DeserializeOwned + 'static>(&self, path: &str) -> Result<T, Error> {
        let response = self.send(Request::new(Method::Get, path)).await?;
        Ok(self.decode::<T>(&response)?.into_object()?)
    }

    /// GET `path` and decode a list of `T`.
    pub async fn get_all<T: DeserializeOwned + 'static>(&self, path: &str) -> Result<Vec<T>, Error> {
        let response = self.send(Request::new(Method::Get, path)).await?;
        Ok(self.decode::<T>(&response)?.into_objects()?)
    }

    /// Refresh `object` from its resource path.
    pub async fn get_object<T: Serialize + DeserializeOwned + 'static>(&self, object: &T) -> Result<T, Error> {
        let path = self.resource_path_for(object)?;
        self.get(&path).await
    }

    /// POST `object` to a collection path such as `/contacts`.
    pub async fn post<T: Serialize + 'static>(&self, path: &str, object: &T) -> Result<Response, Error> {
        let request = self.with_object(Request::new(Method::Post, path), object)?;
        self.send(request).await
    }

    /// PUT `object` to its resource path.
    pub async fn put<T: Serialize + 'static>(&self, object: &T) -> Result<Response, Error> {
        let path = self.resource_path_for(object)?;
        let request = self.with_object(Request::new(Method::Put, &path), object)?;
        self.send(request).await
    }

    /// DELETE `object` at its resource path.
    pub async fn delete<T: Serialize + 'static>(&self, object: &T) -> Result<Response, Error> {
        let path = self.resource_path_for(object)?;
        self.send(Request::new(Method::Delete, &path)).await
    }

    fn with_object<T: Serialize + 'static>(&self, request: Request, object: &T) -> Result<Request, Error> {
        let serializer = self.mapper.serializer_for_object(object)?;
        Ok(request
            .with_header("content-type", serializer.mime_type())
            .with_body(serializer.to_bytes()?))
    }

    fn decode<T: 'static>(&self, response: &Response) -> Result<intairact_core::MappingResult, MappingError> {
        let mapping = self
            .mapper
            .mapping_for::<T>()
            .ok_or_else(|| MappingError::Unmapped(type_name::<T>().to_string()))?;
        self.mapper.decode(response.body(), mapping.key())
    }

    /// Send and require a 2xx answer.
    async fn send(&self, request: Request) -> Result<Response, Error> {
        let response = self
            .client
            .send(self.device.addr(), &request)
            .await?;
        if !response.status().is_success() {
            return Err(Error::Status {
                status: response.status(),
                body: String::from_utf8_lossy(response.body()).into_owned(),
            });
        }
        Ok(response)
    }
}
