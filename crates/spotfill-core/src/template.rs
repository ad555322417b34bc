//! Deployment template fragment for the scheduled reconciliation function.
//!
//! [`render`] returns the `Resources` a stack needs to run a reconciliation pass
//! every minute: an execution role, the function, its schedule and invoke
//! permission, and an error alarm. Options name logical resources of the
//! enclosing stack, which the fragment references rather than creates.
//!
//! The handler names the binary only. The function's bootstrap has to run it
//! as `spotfill-control-plane reconcile`, since a subcommand cannot come from
//! the environment. The inventory snapshot path reaches the function through
//! `SPOTFILL_INVENTORY` when the `inventory` option is set; otherwise the
//! bootstrap must pass `--inventory` itself.

use crate::{CoreError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

pub const DEFAULT_HANDLER: &str = "spotfill-control-plane";
const ROLE: &str = "SpotfillRole";
const FUNCTION: &str = "SpotfillFunction";
const SCHEDULE: &str = "SpotfillSchedule";
const SCHEDULE_PERMISSION: &str = "SpotfillSchedulePermission";
const ERROR_ALARM: &str = "SpotfillFunctionErrorAlarm";

/// Where alarm notifications go: a logical topic name, or a literal
/// template expression used verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AlarmTopic {
    Logical(String),
    Expression(Map<String, Value>),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TemplateOptions {
    pub name: Option<String>,
    pub handler: Option<String>,
    pub spot_fleet: Option<String>,
    pub spot_group: Option<String>,
    /// Logical name of a list parameter, or comma-separated logical names of
    /// one parameter per type.
    pub spot_instance_types: Option<String>,
    pub spot_instance_weights: Option<String>,
    pub on_demand_weight: Option<String>,
    pub on_demand_group: Option<String>,
    /// Must name a simple scaling policy.
    pub scale_down_policy: Option<String>,
    pub alarm_topic: Option<AlarmTopic>,
    pub code_bucket: Option<String>,
    pub code_key: Option<String>,
    /// Inventory snapshot path exported as `SPOTFILL_INVENTORY`.
    pub inventory: Option<String>,
}

fn reference(logical: &str) -> Value {
    json!({ "Ref": logical })
}

fn get_att(logical: &str, attribute: &str) -> Value {
    json!({ "Fn::GetAtt": [logical, attribute] })
}

fn join(delimiter: &str, parts: Value) -> Value {
    json!({ "Fn::Join": [delimiter, parts] })
}

fn present<'a>(value: &'a Option<String>) -> Option<&'a str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

fn require<'a>(value: &'a Option<String>, message: &str) -> Result<&'a str> {
    present(value).ok_or_else(|| CoreError::Config(message.to_string()))
}

struct Weighting<'a> {
    types: &'a str,
    weights: &'a str,
    on_demand: &'a str,
}

struct Validated<'a> {
    spot_variable: (&'static str, &'a str),
    on_demand_group: &'a str,
    scale_down_policy: &'a str,
    alarm_topic: &'a AlarmTopic,
    code_bucket: &'a str,
    code_key: &'a str,
    handler: &'a str,
    inventory: Option<&'a str>,
    weighting: Option<Weighting<'a>>,
}

impl TemplateOptions {
    fn validate(&self) -> Result<Validated<'_>> {
        require(&self.name, "the application name is required")?;
        let spot_variable = match (present(&self.spot_fleet), present(&self.spot_group)) {
            (Some(fleet), _) => ("SPOT_FLEET", fleet),
            (None, Some(group)) => ("SPOT_GROUP", group),
            (None, None) => {
                return Err(CoreError::Config(
                    "the logical name of a spot fleet or a spot group is required".to_string(),
                ))
            }
        };
        let on_demand_group = require(
            &self.on_demand_group,
            "the logical name of an on-demand group is required",
        )?;
        let scale_down_policy = require(
            &self.scale_down_policy,
            "the logical name of a scaling policy that shrinks the on-demand group is required",
        )?;
        let alarm_topic = self.alarm_topic.as_ref().ok_or_else(|| {
            CoreError::Config(
                "the logical name of a topic to receive error alarms is required".to_string(),
            )
        })?;

        let weighting = match (
            present(&self.spot_instance_types),
            present(&self.spot_instance_weights),
            present(&self.on_demand_weight),
        ) {
            (None, None, None) => None,
            (Some(types), Some(weights), Some(on_demand)) => Some(Weighting {
                types,
                weights,
                on_demand,
            }),
            _ => {
                return Err(CoreError::Config(
                    "spot instance types, spot instance weights and on-demand weight must be set together"
                        .to_string(),
                ))
            }
        };

        let code_bucket = require(
            &self.code_bucket,
            "the bucket containing the function code is required",
        )?;
        let code_key = require(&self.code_key, "the key of the function code is required")?;

        Ok(Validated {
            spot_variable,
            on_demand_group,
            scale_down_policy,
            alarm_topic,
            code_bucket,
            code_key,
            handler: present(&self.handler).unwrap_or(DEFAULT_HANDLER),
            inventory: present(&self.inventory),
            weighting,
        })
    }
}

fn role() -> Value {
    json!({
        "Type": "AWS::IAM::Role",
        "Properties": {
            "AssumeRolePolicyDocument": {
                "Statement": [{
                    "Effect": "Allow",
                    "Principal": { "Service": "lambda.amazonaws.com" },
                    "Action": ["sts:AssumeRole"]
                }]
            },
            "Policies": [{
                "PolicyName": "run-spotfill",
                "PolicyDocument": {
                    "Statement": [
                        { "Effect": "Allow", "Action": ["logs:*"], "Resource": "*" },
                        {
                            "Effect": "Allow",
                            "Action": [
                                "cloudformation:DescribeStacks",
                                "cloudwatch:GetMetricStatistics",
                                "autoscaling:DescribeAutoScalingGroups",
                                "autoscaling:SetDesiredCapacity",
                                "autoscaling:ExecutePolicy",
                                "ec2:DescribeSpotFleetInstances",
                                "ec2:DescribeSpotFleetRequests",
                                "ec2:DescribeInstances",
                                "ec2:DeleteTags"
                            ],
                            "Resource": "*"
                        }
                    ]
                }
            }]
        }
    })
}

fn environment(options: &Validated<'_>) -> Value {
    let mut variables = Map::new();
    variables.insert("ON_DEMAND_GROUP".to_string(), reference(options.on_demand_group));
    variables.insert(
        "ON_DEMAND_SCALE_DOWN_POLICY".to_string(),
        reference(options.scale_down_policy),
    );
    variables.insert("STACK_NAME".to_string(), reference("AWS::StackName"));
    let (spot_key, spot_logical) = options.spot_variable;
    variables.insert(spot_key.to_string(), reference(spot_logical));
    if let Some(path) = options.inventory {
        variables.insert("SPOTFILL_INVENTORY".to_string(), json!(path));
    }

    if let Some(weighting) = &options.weighting {
        let types = if weighting.types.contains(',') {
            let refs: Vec<Value> = weighting
                .types
                .split(',')
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(reference)
                .collect();
            join(" ", Value::Array(refs))
        } else {
            reference(weighting.types)
        };
        variables.insert("SPOT_INSTANCE_TYPES".to_string(), types);
        variables.insert(
            "SPOT_INSTANCE_WEIGHTS".to_string(),
            join(" ", reference(weighting.weights)),
        );
        variables.insert("ON_DEMAND_WEIGHT".to_string(), reference(weighting.on_demand));
    }

    json!({ "Variables": variables })
}

fn function(options: &Validated<'_>) -> Value {
    json!({
        "Type": "AWS::Lambda::Function",
        "Properties": {
            "Code": { "S3Bucket": options.code_bucket, "S3Key": options.code_key },
            "Environment": environment(options),
            "Role": get_att(ROLE, "Arn"),
            "Description": "Launch on-demand instances in response to spot price-out",
            "Handler": options.handler,
            "MemorySize": 128,
            "Runtime": "provided.al2023",
            "Timeout": 300
        }
    })
}

fn schedule() -> Value {
    json!({
        "Type": "AWS::Events::Rule",
        "Properties": {
            "Description": "Run the reconciliation pass every minute",
            "Name": join("", json!(["spotfill-", reference("AWS::StackName")])),
            "ScheduleExpression": "cron(0/1 * * * ? *)",
            "Targets": [{ "Arn": get_att(FUNCTION, "Arn"), "Id": FUNCTION }]
        }
    })
}

fn schedule_permission() -> Value {
    json!({
        "Type": "AWS::Lambda::Permission",
        "Properties": {
            "Action": "lambda:InvokeFunction",
            "FunctionName": get_att(FUNCTION, "Arn"),
            "Principal": "events.amazonaws.com",
            "SourceArn": get_att(SCHEDULE, "Arn")
        }
    })
}

fn error_alarm(topic: &AlarmTopic) -> Value {
    let target = match topic {
        AlarmTopic::Logical(name) => reference(name),
        AlarmTopic::Expression(expression) => Value::Object(expression.clone()),
    };

    json!({
        "Type": "AWS::CloudWatch::Alarm",
        "Properties": {
            "AlarmDescription": "Errors from the spotfill reconciliation function",
            "Period": 60,
            "EvaluationPeriods": 1,
            "Statistic": "Sum",
            "Threshold": 2,
            "ComparisonOperator": "GreaterThanThreshold",
            "Namespace": "AWS/Lambda",
            "Dimensions": [{ "Name": "FunctionName", "Value": reference(FUNCTION) }],
            "MetricName": "Errors",
            "AlarmActions": [target.clone()],
            "InsufficientDataActions": [target]
        }
    })
}

/// Validate `options` and build the template fragment.
pub fn render(options: &TemplateOptions) -> Result<Value> {
    let validated = options.validate()?;

    let mut resources = Map::new();
    resources.insert(ROLE.to_string(), role());
    resources.insert(FUNCTION.to_string(), function(&validated));
    resources.insert(SCHEDULE.to_string(), schedule());
    resources.insert(SCHEDULE_PERMISSION.to_string(), schedule_permission());
    resources.insert(ERROR_ALARM.to_string(), error_alarm(validated.alarm_topic));

    Ok(json!({ "Resources": resources }))
}
