//! Resource tagging operations.

use super::{Api, ApiError};
use kecs_shared::ecs::Tag;
use serde::Deserialize;
use serde_json::{json, Value};

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct TagResourceRequest {
    pub resource_arn: String,
    pub tags: Vec<Tag>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct UntagResourceRequest {
    pub resource_arn: String,
    pub tag_keys: Vec<String>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ListTagsForResourceRequest {
    pub resource_arn: String,
}

fn validate_resource_arn(arn: &str) -> Result<(), ApiError> {
    if !arn.starts_with("arn:aws:ecs:") {
        return Err(ApiError::validation(format!(
            "{} is not an ECS resource ARN",
            arn
        )));
    }
    Ok(())
}

fn validate_tags(tags: &[Tag]) -> Result<(), ApiError> {
    if tags.is_empty() {
        return Err(ApiError::validation("tags must not be empty"));
    }
    for tag in tags {
        if tag.key.is_empty() || tag.key.len() > 128 {
            return Err(ApiError::validation(
                "tag keys must be between 1 and 128 characters",
            ));
        }
        if tag.value.len() > 256 {
            return Err(ApiError::validation(
                "tag values must be at most 256 characters",
            ));
        }
    }
    Ok(())
}

impl Api {
    pub async fn tag_resource(&self, request: TagResourceRequest) -> Result<Value, ApiError> {
        validate_resource_arn(&request.resource_arn)?;
        validate_tags(&request.tags)?;
        self.ctx
            .store
            .put_tags(&request.resource_arn, &request.tags)
            .await?;
        Ok(json!({}))
    }

    pub async fn untag_resource(&self, request: UntagResourceRequest) -> Result<Value, ApiError> {
        validate_resource_arn(&request.resource_arn)?;
        if request.tag_keys.is_empty() {
            return Err(ApiError::validation("tagKeys must not be empty"));
        }
        self.ctx
            .store
            .remove_tags(&request.resource_arn, &request.tag_keys)
            .await?;
        Ok(json!({}))
    }

    pub async fn list_tags_for_resource(
        &self,
        request: ListTagsForResourceRequest,
    ) -> Result<Value, ApiError> {
        validate_resource_arn(&request.resource_arn)?;
        let tags = self.ctx.store.list_tags(&request.resource_arn).await?;
        Ok(json!({ "tags": tags }))
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{call, test_api};
    use super::*;

    const CLUSTER_ARN: &str = "arn:aws:ecs:us-east-1:000000000000:cluster/production";

    #[tokio::test]
    async fn test_tag_untag_list_round_trip() {
        let api = test_api();
        call(
            &api,
            "TagResource",
            json!({
                "resourceArn": CLUSTER_ARN,
                "tags": [
                    {"key": "env", "value": "prod"},
                    {"key": "team", "value": "core"}
                ]
            }),
        )
        .await
        .unwrap();

        let listed = call(
            &api,
            "ListTagsForResource",
            json!({"resourceArn": CLUSTER_ARN}),
        )
        .await
        .unwrap();
        assert_eq!(2, listed["tags"].as_array().unwrap().len());

        call(
            &api,
            "UntagResource",
            json!({"resourceArn": CLUSTER_ARN, "tagKeys": ["env"]}),
        )
        .await
        .unwrap();
        let listed = call(
            &api,
            "ListTagsForResource",
            json!({"resourceArn": CLUSTER_ARN}),
        )
        .await
        .unwrap();
        assert_eq!(json!([{"key": "team", "value": "core"}]), listed["tags"]);
    }

    #[tokio::test]
    async fn test_non_ecs_arn_rejected() {
        let api = test_api();
        let error = call(
            &api,
            "TagResource",
            json!({
                "resourceArn": "arn:aws:s3:::bucket",
                "tags": [{"key": "env", "value": "prod"}]
            }),
        )
        .await
        .unwrap_err();
        assert_eq!("InvalidParameterException", error.kind);
    }

    #[tokio::test]
    async fn test_empty_tags_rejected() {
        let api = test_api();
        let error = call(
            &api,
            "TagResource",
            json!({"resourceArn": CLUSTER_ARN, "tags": []}),
        )
        .await
        .unwrap_err();
        assert_eq!("InvalidParameterException", error.kind);
    }
}
