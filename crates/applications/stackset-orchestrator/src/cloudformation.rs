//! CloudFormation StackSets client
//!
//! Implements [`DeploymentService`] on top of `aws-sdk-cloudformation`. SDK
//! error codes are mapped to [`ServiceErrorKind`] here and nowhere else.

use crate::error::{ServiceError, ServiceErrorKind, ServiceResult};
use crate::parameters::ParameterSet;
use crate::service::{
    DeleteInstancesRequest, DeploymentService, InstanceStatus, InstancesRequest, OperationKind,
    OperationStatus, OperationSummary, StackInstanceDetail, StackInstanceSummary,
    StackSetDescription, StackSetUpdate,
};
use crate::target::TargetId;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_cloudformation::Client;
use aws_sdk_cloudformation::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_cloudformation::primitives::DateTime as AwsDateTime;
use aws_sdk_cloudformation::types::{
    Capability, Parameter as AwsParameter, StackInstanceDetailedStatus, StackSetOperation,
    StackSetOperationAction, StackSetOperationSummary,
};
use aws_types::region::Region;
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::error::Error as StdError;
use std::fmt::Debug;
use tracing::debug;

/// Operations fetched per listing page
const OPERATIONS_PAGE_SIZE: i32 = 20;

/// Where to load AWS credentials and region from
#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    /// Named profile from the shared config files
    pub profile: Option<String>,

    /// Region the stack-set lives in
    pub region: Option<String>,
}

impl ClientConfig {
    /// Use a named profile
    pub fn with_profile(mut self, profile: impl Into<String>) -> Self {
        self.profile = Some(profile.into());
        self
    }

    /// Use a region
    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }
}

/// StackSets client backed by the AWS SDK
#[derive(Debug, Clone)]
pub struct CloudFormationClient {
    client: Client,
}

impl CloudFormationClient {
    /// Wrap an existing SDK client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Create from AWS config
    pub fn from_sdk_config(config: &aws_config::SdkConfig) -> Self {
        Self::new(Client::new(config))
    }

    /// Load AWS configuration and create a client
    pub async fn from_client_config(config: ClientConfig) -> Self {
        debug!(
            profile = ?config.profile,
            region = ?config.region,
            "Creating CloudFormation client"
        );

        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(profile) = config.profile {
            loader = loader.profile_name(profile);
        }
        if let Some(region) = config.region {
            loader = loader.region(Region::new(region));
        }

        Self::from_sdk_config(&loader.load().await)
    }
}

#[async_trait]
impl DeploymentService for CloudFormationClient {
    async fn create_stack_set(
        &self,
        name: &str,
        template_body: &str,
        parameters: &ParameterSet,
    ) -> ServiceResult<String> {
        let output = self
            .client
            .create_stack_set()
            .stack_set_name(name)
            .template_body(template_body)
            .set_parameters(Some(to_aws_parameters(parameters)))
            .capabilities(Capability::CapabilityNamedIam)
            .send()
            .await
            .map_err(|e| map_sdk_error("CreateStackSet", e))?;

        Ok(output.stack_set_id().unwrap_or(name).to_string())
    }

    async fn update_stack_set(&self, request: &StackSetUpdate) -> ServiceResult<String> {
        let output = self
            .client
            .update_stack_set()
            .stack_set_name(&request.stack_set_name)
            .template_body(&request.template_body)
            .set_parameters(Some(to_aws_parameters(&request.parameters)))
            .set_accounts(Some(request.accounts.clone()))
            .set_regions(Some(request.regions.clone()))
            .operation_id(&request.operation_id)
            .capabilities(Capability::CapabilityNamedIam)
            .send()
            .await
            .map_err(|e| map_sdk_error("UpdateStackSet", e))?;

        Ok(accepted_operation_id(output.operation_id(), &request.operation_id))
    }

    async fn create_stack_instances(&self, request: &InstancesRequest) -> ServiceResult<String> {
        let output = self
            .client
            .create_stack_instances()
            .stack_set_name(&request.stack_set_name)
            .set_accounts(Some(request.accounts.clone()))
            .set_regions(Some(request.regions.clone()))
            .set_parameter_overrides(Some(to_aws_parameters(&request.parameter_overrides)))
            .operation_id(&request.operation_id)
            .send()
            .await
            .map_err(|e| map_sdk_error("CreateStackInstances", e))?;

        Ok(accepted_operation_id(output.operation_id(), &request.operation_id))
    }

    async fn update_stack_instances(&self, request: &InstancesRequest) -> ServiceResult<String> {
        let output = self
            .client
            .update_stack_instances()
            .stack_set_name(&request.stack_set_name)
            .set_accounts(Some(request.accounts.clone()))
            .set_regions(Some(request.regions.clone()))
            .set_parameter_overrides(Some(to_aws_parameters(&request.parameter_overrides)))
            .operation_id(&request.operation_id)
            .send()
            .await
            .map_err(|e| map_sdk_error("UpdateStackInstances", e))?;

        Ok(accepted_operation_id(output.operation_id(), &request.operation_id))
    }

    async fn delete_stack_instances(
        &self,
        request: &DeleteInstancesRequest,
    ) -> ServiceResult<String> {
        let output = self
            .client
            .delete_stack_instances()
            .stack_set_name(&request.stack_set_name)
            .set_accounts(Some(request.accounts.clone()))
            .set_regions(Some(request.regions.clone()))
            .retain_stacks(request.retain_stacks)
            .operation_id(&request.operation_id)
            .send()
            .await
            .map_err(|e| map_sdk_error("DeleteStackInstances", e))?;

        Ok(accepted_operation_id(output.operation_id(), &request.operation_id))
    }

    async fn get_template_summary(
        &self,
        name: &str,
        template_body: Option<&str>,
    ) -> ServiceResult<BTreeSet<String>> {
        let request = self.client.get_template_summary();
        let request = match template_body {
            Some(body) => request.template_body(body),
            None => request.stack_set_name(name),
        };
        let output = request
            .send()
            .await
            .map_err(|e| map_sdk_error("GetTemplateSummary", e))?;

        Ok(output
            .parameters()
            .iter()
            .filter_map(|p| p.parameter_key())
            .map(str::to_string)
            .collect())
    }

    async fn describe_stack_set(&self, name: &str) -> ServiceResult<StackSetDescription> {
        let output = self
            .client
            .describe_stack_set()
            .stack_set_name(name)
            .send()
            .await
            .map_err(|e| map_sdk_error("DescribeStackSet", e))?;

        let stack_set = output.stack_set().ok_or_else(|| {
            ServiceError::new(
                ServiceErrorKind::StackSetNotFound,
                format!("StackSet {} not returned", name),
            )
        })?;

        Ok(StackSetDescription {
            name: stack_set.stack_set_name().unwrap_or(name).to_string(),
            template_body: stack_set.template_body().map(str::to_string),
            parameters: from_aws_parameters(stack_set.parameters()),
        })
    }

    async fn list_stack_instances(&self, name: &str) -> ServiceResult<Vec<StackInstanceSummary>> {
        let mut instances = Vec::new();
        let mut next_token: Option<String> = None;

        loop {
            let output = self
                .client
                .list_stack_instances()
                .stack_set_name(name)
                .set_next_token(next_token.take())
                .send()
                .await
                .map_err(|e| map_sdk_error("ListStackInstances", e))?;

            for summary in output.summaries() {
                let (Some(account), Some(region)) = (summary.account(), summary.region()) else {
                    continue;
                };
                instances.push(StackInstanceSummary {
                    id: TargetId::new(account, region),
                    status: instance_status(summary.status().map(|s| s.as_str())),
                    last_operation_failed: last_operation_failed(
                        summary
                            .stack_instance_status()
                            .and_then(|s| s.detailed_status()),
                    ),
                    status_reason: summary.status_reason().map(str::to_string),
                });
            }

            match output.next_token() {
                Some(token) => next_token = Some(token.to_string()),
                None => break,
            }
        }

        debug!(stack_set = %name, instances = instances.len(), "Listed stack instances");
        Ok(instances)
    }

    async fn describe_stack_instance(
        &self,
        name: &str,
        account: &str,
        region: &str,
    ) -> ServiceResult<StackInstanceDetail> {
        let output = self
            .client
            .describe_stack_instance()
            .stack_set_name(name)
            .stack_instance_account(account)
            .stack_instance_region(region)
            .send()
            .await
            .map_err(|e| map_sdk_error("DescribeStackInstance", e))?;

        let instance = output.stack_instance().ok_or_else(|| {
            ServiceError::new(
                ServiceErrorKind::InstanceNotFound,
                format!("stack instance {}/{} not returned", account, region),
            )
        })?;

        Ok(StackInstanceDetail {
            summary: StackInstanceSummary {
                id: TargetId::new(account, region),
                status: instance_status(instance.status().map(|s| s.as_str())),
                last_operation_failed: last_operation_failed(
                    instance
                        .stack_instance_status()
                        .and_then(|s| s.detailed_status()),
                ),
                status_reason: instance.status_reason().map(str::to_string),
            },
            parameter_overrides: from_aws_parameters(instance.parameter_overrides()),
        })
    }

    async fn list_stack_set_operations(&self, name: &str) -> ServiceResult<Vec<OperationSummary>> {
        // The service lists newest first; an active operation is always on page one
        let output = self
            .client
            .list_stack_set_operations()
            .stack_set_name(name)
            .max_results(OPERATIONS_PAGE_SIZE)
            .send()
            .await
            .map_err(|e| map_sdk_error("ListStackSetOperations", e))?;

        Ok(output
            .summaries()
            .iter()
            .filter_map(operation_from_summary)
            .collect())
    }

    async fn describe_stack_set_operation(
        &self,
        name: &str,
        operation_id: &str,
    ) -> ServiceResult<OperationSummary> {
        let output = self
            .client
            .describe_stack_set_operation()
            .stack_set_name(name)
            .operation_id(operation_id)
            .send()
            .await
            .map_err(|e| map_sdk_error("DescribeStackSetOperation", e))?;

        output
            .stack_set_operation()
            .and_then(operation_from_detail)
            .ok_or_else(|| {
                ServiceError::new(
                    ServiceErrorKind::OperationNotFound,
                    format!("operation {} returned no recognizable status", operation_id),
                )
            })
    }
}

/// Classify an SDK error
fn map_sdk_error<E, R>(operation: &str, err: SdkError<E, R>) -> ServiceError
where
    E: ProvideErrorMetadata + StdError + Send + Sync + 'static,
    R: Debug,
{
    let message = format!("{} failed: {}", operation, DisplayErrorContext(&err));
    match &err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) => ServiceError::network(message),
        SdkError::ResponseError(_) => ServiceError::new(ServiceErrorKind::Unavailable, message),
        _ => match err.code() {
            Some(code) => ServiceError::from_code(code, message),
            None => ServiceError::new(ServiceErrorKind::Unknown, message),
        },
    }
}

fn accepted_operation_id(returned: Option<&str>, proposed: &str) -> String {
    returned.unwrap_or(proposed).to_string()
}

fn to_aws_parameters(parameters: &ParameterSet) -> Vec<AwsParameter> {
    parameters
        .iter()
        .map(|p| {
            AwsParameter::builder()
                .parameter_key(&p.key)
                .parameter_value(&p.value)
                .build()
        })
        .collect()
}

fn from_aws_parameters(parameters: &[AwsParameter]) -> ParameterSet {
    let mut set = ParameterSet::new();
    for parameter in parameters {
        if let Some(key) = parameter.parameter_key() {
            set.insert(key, parameter.parameter_value().unwrap_or_default());
        }
    }
    set
}

fn instance_status(status: Option<&str>) -> InstanceStatus {
    // Unrecognized statuses are treated as needing an update
    status
        .and_then(InstanceStatus::parse)
        .unwrap_or(InstanceStatus::Outdated)
}

fn last_operation_failed(detailed: Option<&StackInstanceDetailedStatus>) -> bool {
    matches!(
        detailed,
        Some(StackInstanceDetailedStatus::Failed) | Some(StackInstanceDetailedStatus::Cancelled)
    )
}

fn operation_kind(action: Option<&StackSetOperationAction>) -> Option<OperationKind> {
    match action? {
        StackSetOperationAction::Create => Some(OperationKind::Create),
        StackSetOperationAction::Update => Some(OperationKind::Update),
        StackSetOperationAction::Delete => Some(OperationKind::Delete),
        StackSetOperationAction::DetectDrift => Some(OperationKind::DetectDrift),
        _ => None,
    }
}

fn to_chrono(dt: &AwsDateTime) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(dt.secs(), dt.subsec_nanos())
}

fn operation_from_summary(summary: &StackSetOperationSummary) -> Option<OperationSummary> {
    Some(OperationSummary {
        operation_id: summary.operation_id()?.to_string(),
        kind: operation_kind(summary.action()),
        status: OperationStatus::parse(summary.status()?.as_str())?,
        status_reason: summary.status_reason().map(str::to_string),
        created_at: summary.creation_timestamp().and_then(to_chrono),
    })
}

fn operation_from_detail(operation: &StackSetOperation) -> Option<OperationSummary> {
    Some(OperationSummary {
        operation_id: operation.operation_id()?.to_string(),
        kind: operation_kind(operation.action()),
        status: OperationStatus::parse(operation.status()?.as_str())?,
        status_reason: operation.status_reason().map(str::to_string),
        created_at: operation.creation_timestamp().and_then(to_chrono),
    })
}
