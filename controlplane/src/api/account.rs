//! Account settings, attributes and container-instance operations.
//!
//! Container instances do not exist in this control plane (the cluster
//! node is the only "instance"), so their listings are served empty and
//! describes fail each requested instance.

use super::{Api, ApiError};
use kecs_shared::ecs::{AccountSetting, Attribute};
use serde::Deserialize;
use serde_json::{json, Value};

/// Setting names PutAccountSetting accepts
const KNOWN_SETTINGS: &[&str] = &[
    "serviceLongArnFormat",
    "taskLongArnFormat",
    "containerInstanceLongArnFormat",
    "awsvpcTrunking",
    "containerInsights",
    "fargateFIPSMode",
    "tagResourceAuthorization",
];

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PutAccountSettingRequest {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub principal_arn: Option<String>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PutAccountSettingDefaultRequest {
    pub name: String,
    pub value: String,
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ListAccountSettingsRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub principal_arn: Option<String>,
    #[serde(default)]
    pub effective_settings: Option<bool>,
    #[serde(default)]
    pub max_results: Option<i32>,
    #[serde(default)]
    pub next_token: Option<String>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct DeleteAccountSettingRequest {
    pub name: String,
    #[serde(default)]
    pub principal_arn: Option<String>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PutAttributesRequest {
    #[serde(default)]
    pub cluster: Option<String>,
    pub attributes: Vec<Attribute>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct DeleteAttributesRequest {
    #[serde(default)]
    pub cluster: Option<String>,
    pub attributes: Vec<Attribute>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ListAttributesRequest {
    #[serde(default)]
    pub cluster: Option<String>,
    #[serde(default)]
    pub target_type: Option<String>,
    #[serde(default)]
    pub attribute_name: Option<String>,
    #[serde(default)]
    pub attribute_value: Option<String>,
    #[serde(default)]
    pub max_results: Option<i32>,
    #[serde(default)]
    pub next_token: Option<String>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ListContainerInstancesRequest {
    #[serde(default)]
    pub cluster: Option<String>,
    #[serde(default)]
    pub filter: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub max_results: Option<i32>,
    #[serde(default)]
    pub next_token: Option<String>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct DescribeContainerInstancesRequest {
    #[serde(default)]
    pub cluster: Option<String>,
    pub container_instances: Vec<String>,
    #[serde(default)]
    pub include: Option<Vec<String>>,
}

fn validate_setting_name(name: &str) -> Result<(), ApiError> {
    if !KNOWN_SETTINGS.contains(&name) {
        return Err(ApiError::validation(format!(
            "unknown account setting: {}",
            name
        )));
    }
    Ok(())
}

fn validate_setting_value(value: &str) -> Result<(), ApiError> {
    match value {
        "enabled" | "disabled" => Ok(()),
        other => Err(ApiError::validation(format!(
            "account setting value must be enabled or disabled, got {}",
            other
        ))),
    }
}

impl Api {
    pub async fn put_account_setting(
        &self,
        request: PutAccountSettingRequest,
    ) -> Result<Value, ApiError> {
        validate_setting_name(&request.name)?;
        validate_setting_value(&request.value)?;
        let setting = AccountSetting {
            name: request.name,
            value: request.value,
            principal_arn: request.principal_arn,
        };
        self.ctx.store.put_account_setting(&setting).await?;
        Ok(json!({ "setting": setting }))
    }

    pub async fn put_account_setting_default(
        &self,
        request: PutAccountSettingDefaultRequest,
    ) -> Result<Value, ApiError> {
        validate_setting_name(&request.name)?;
        validate_setting_value(&request.value)?;
        let setting = AccountSetting {
            name: request.name,
            value: request.value,
            principal_arn: None,
        };
        self.ctx.store.put_account_setting(&setting).await?;
        Ok(json!({ "setting": setting }))
    }

    pub async fn list_account_settings(
        &self,
        request: ListAccountSettingsRequest,
    ) -> Result<Value, ApiError> {
        let settings = self.ctx.store.list_account_settings().await?;
        let filtered: Vec<AccountSetting> = settings
            .into_iter()
            .filter(|s| request.name.as_deref().map(|n| s.name == n).unwrap_or(true))
            .filter(|s| {
                request
                    .value
                    .as_deref()
                    .map(|v| s.value == v)
                    .unwrap_or(true)
            })
            .filter(|s| {
                request
                    .principal_arn
                    .as_deref()
                    .map(|p| s.principal_arn.as_deref() == Some(p))
                    .unwrap_or(true)
            })
            .collect();
        Ok(json!({ "settings": filtered }))
    }

    pub async fn delete_account_setting(
        &self,
        request: DeleteAccountSettingRequest,
    ) -> Result<Value, ApiError> {
        validate_setting_name(&request.name)?;
        self.ctx
            .store
            .delete_account_setting(request.principal_arn, &request.name)
            .await?;
        Ok(json!({}))
    }

    pub async fn put_attributes(&self, request: PutAttributesRequest) -> Result<Value, ApiError> {
        if request.attributes.is_empty() {
            return Err(ApiError::validation("attributes must not be empty"));
        }
        for attribute in &request.attributes {
            if attribute.name.is_empty() {
                return Err(ApiError::validation("attribute names must not be empty"));
            }
        }
        let cluster = self.resolve_cluster(request.cluster.as_deref()).await?;
        self.ctx
            .store
            .put_attributes(&cluster.cluster_arn, &request.attributes)
            .await?;
        Ok(json!({ "attributes": request.attributes }))
    }

    pub async fn delete_attributes(
        &self,
        request: DeleteAttributesRequest,
    ) -> Result<Value, ApiError> {
        if request.attributes.is_empty() {
            return Err(ApiError::validation("attributes must not be empty"));
        }
        let cluster = self.resolve_cluster(request.cluster.as_deref()).await?;
        self.ctx
            .store
            .delete_attributes(&cluster.cluster_arn, &request.attributes)
            .await?;
        Ok(json!({ "attributes": request.attributes }))
    }

    pub async fn list_attributes(
        &self,
        request: ListAttributesRequest,
    ) -> Result<Value, ApiError> {
        let cluster = self.resolve_cluster(request.cluster.as_deref()).await?;
        let attributes = self.ctx.store.list_attributes(&cluster.cluster_arn).await?;
        let filtered: Vec<Attribute> = attributes
            .into_iter()
            .filter(|a| {
                request
                    .target_type
                    .as_deref()
                    .map(|t| a.target_type.as_deref() == Some(t))
                    .unwrap_or(true)
            })
            .filter(|a| {
                request
                    .attribute_name
                    .as_deref()
                    .map(|n| a.name == n)
                    .unwrap_or(true)
            })
            .filter(|a| {
                request
                    .attribute_value
                    .as_deref()
                    .map(|v| a.value.as_deref() == Some(v))
                    .unwrap_or(true)
            })
            .collect();
        Ok(json!({ "attributes": filtered }))
    }

    pub async fn list_container_instances(
        &self,
        request: ListContainerInstancesRequest,
    ) -> Result<Value, ApiError> {
        // validate the cluster even though no instances can exist
        self.resolve_cluster(request.cluster.as_deref()).await?;
        Ok(json!({ "containerInstanceArns": [] }))
    }

    pub async fn describe_container_instances(
        &self,
        request: DescribeContainerInstancesRequest,
    ) -> Result<Value, ApiError> {
        if request.container_instances.is_empty() {
            return Err(ApiError::validation(
                "containerInstances must not be empty",
            ));
        }
        self.resolve_cluster(request.cluster.as_deref()).await?;
        let failures: Vec<Value> = request
            .container_instances
            .iter()
            .map(|reference| {
                json!({
                    "arn": reference,
                    "reason": "MISSING",
                })
            })
            .collect();
        Ok(json!({ "containerInstances": [], "failures": failures }))
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{call, test_api};
    use super::*;

    #[tokio::test]
    async fn test_account_setting_round_trip() {
        let api = test_api();
        call(
            &api,
            "PutAccountSetting",
            json!({"name": "taskLongArnFormat", "value": "enabled"}),
        )
        .await
        .unwrap();
        let listed = call(&api, "ListAccountSettings", json!({}))
            .await
            .unwrap();
        assert_eq!("taskLongArnFormat", listed["settings"][0]["name"]);
        assert_eq!("enabled", listed["settings"][0]["value"]);

        call(
            &api,
            "DeleteAccountSetting",
            json!({"name": "taskLongArnFormat"}),
        )
        .await
        .unwrap();
        let listed = call(&api, "ListAccountSettings", json!({}))
            .await
            .unwrap();
        assert!(listed["settings"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_setting_rejected() {
        let api = test_api();
        let error = call(
            &api,
            "PutAccountSetting",
            json!({"name": "warpSpeed", "value": "enabled"}),
        )
        .await
        .unwrap_err();
        assert_eq!("InvalidParameterException", error.kind);

        let error = call(
            &api,
            "PutAccountSetting",
            json!({"name": "taskLongArnFormat", "value": "maybe"}),
        )
        .await
        .unwrap_err();
        assert_eq!("InvalidParameterException", error.kind);
    }

    #[tokio::test]
    async fn test_attributes_round_trip() {
        let api = test_api();
        call(&api, "CreateCluster", json!({"clusterName": "production"}))
            .await
            .unwrap();
        call(
            &api,
            "PutAttributes",
            json!({
                "cluster": "production",
                "attributes": [
                    {"name": "ecs.zone", "value": "us-east-1a", "targetType": "container-instance", "targetId": "node-1"}
                ]
            }),
        )
        .await
        .unwrap();
        let listed = call(&api, "ListAttributes", json!({"cluster": "production"}))
            .await
            .unwrap();
        assert_eq!("ecs.zone", listed["attributes"][0]["name"]);

        call(
            &api,
            "DeleteAttributes",
            json!({
                "cluster": "production",
                "attributes": [{"name": "ecs.zone", "targetId": "node-1"}]
            }),
        )
        .await
        .unwrap();
        let listed = call(&api, "ListAttributes", json!({"cluster": "production"}))
            .await
            .unwrap();
        assert!(listed["attributes"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_container_instances_are_empty() {
        let api = test_api();
        call(&api, "CreateCluster", json!({"clusterName": "production"}))
            .await
            .unwrap();
        let listed = call(
            &api,
            "ListContainerInstances",
            json!({"cluster": "production"}),
        )
        .await
        .unwrap();
        assert!(listed["containerInstanceArns"].as_array().unwrap().is_empty());

        let described = call(
            &api,
            "DescribeContainerInstances",
            json!({"cluster": "production", "containerInstances": ["abc"]}),
        )
        .await
        .unwrap();
        assert_eq!("MISSING", described["failures"][0]["reason"]);
    }
}
