//! UPnP device description and service introspection
//!
//! HEOS players publish an `aios_device` description whose sub-devices each
//! declare services. [`UpnpDevice::fetch`] loads the description, every
//! service description (SCPD) and builds the action tables that
//! [`UpnpDevice::invoke`] validates calls against.

use crate::error::{HeosError, Result};
use crate::soap::{self, SoapResult};
use futures_util::future::try_join_all;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::time::Duration;

/// Port of the description server on HEOS players
pub const DESCRIPTION_PORT: u16 = 60006;

const DESCRIPTION_PATH: &str = "/upnp/desc/aios_device/aios_device.xml";

/// Client identification sent with every HTTP request
pub const USER_AGENT: &str = "heos-control/0.1 UPnP/1.1";

// Description documents

#[derive(Debug, Deserialize)]
struct RootDoc {
    device: DeviceDoc,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeviceDoc {
    #[serde(default)]
    device_type: String,
    #[serde(default)]
    friendly_name: String,
    #[serde(default)]
    manufacturer: String,
    #[serde(default)]
    model_name: String,
    model_number: Option<String>,
    serial_number: Option<String>,
    #[serde(rename = "UDN", default)]
    udn: String,
    service_list: Option<ServiceListDoc>,
    device_list: Option<DeviceListDoc>,
}

#[derive(Debug, Deserialize)]
struct ServiceListDoc {
    #[serde(rename = "service", default)]
    services: Vec<ServiceDoc>,
}

#[derive(Debug, Deserialize)]
struct DeviceListDoc {
    #[serde(rename = "device", default)]
    devices: Vec<DeviceDoc>,
}

#[derive(Debug, Deserialize)]
struct ServiceDoc {
    #[serde(rename = "serviceType")]
    service_type: String,
    #[serde(rename = "serviceId")]
    service_id: String,
    #[serde(rename = "controlURL")]
    control_url: String,
    #[serde(rename = "eventSubURL", default)]
    event_sub_url: Option<String>,
    #[serde(rename = "SCPDURL")]
    scpd_url: String,
}

#[derive(Debug, Deserialize)]
struct ScpdDoc {
    #[serde(rename = "actionList", default)]
    action_list: Option<ActionListDoc>,
    #[serde(rename = "serviceStateTable", default)]
    state_table: Option<StateTableDoc>,
}

#[derive(Debug, Deserialize)]
struct ActionListDoc {
    #[serde(rename = "action", default)]
    actions: Vec<ActionDoc>,
}

#[derive(Debug, Deserialize)]
struct ActionDoc {
    name: String,
    #[serde(rename = "argumentList", default)]
    argument_list: Option<ArgumentListDoc>,
}

#[derive(Debug, Deserialize)]
struct ArgumentListDoc {
    #[serde(rename = "argument", default)]
    arguments: Vec<ArgumentDoc>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ArgumentDoc {
    name: String,
    direction: String,
    #[serde(default)]
    related_state_variable: String,
}

#[derive(Debug, Deserialize)]
struct StateTableDoc {
    #[serde(rename = "stateVariable", default)]
    variables: Vec<StateVariableDoc>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StateVariableDoc {
    name: String,
    data_type: String,
    #[serde(rename = "@sendEvents", default)]
    send_events: Option<String>,
    allowed_value_list: Option<AllowedValuesDoc>,
}

#[derive(Debug, Deserialize)]
struct AllowedValuesDoc {
    #[serde(rename = "allowedValue", default)]
    values: Vec<String>,
}

/// Identity of the root device
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceInfo {
    pub device_type: String,
    pub friendly_name: String,
    pub manufacturer: String,
    pub model_name: String,
    pub model_number: Option<String>,
    pub serial_number: Option<String>,
    pub udn: String,
}

/// Declared state variable of a service
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StateVariable {
    pub name: String,
    pub data_type: String,
    pub allowed_values: Vec<String>,
    pub send_events: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    In,
    Out,
}

/// Action argument annotated with its related state variable
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Argument {
    pub name: String,
    pub direction: Direction,
    pub related_state_variable: String,
    pub data_type: Option<String>,
    pub allowed_values: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Action {
    pub name: String,
    pub inputs: Vec<Argument>,
    pub outputs: Vec<Argument>,
}

/// A service with absolute URLs and its action table
#[derive(Debug, Clone)]
pub struct Service {
    /// `serviceId`, e.g. `urn:upnp-org:serviceId:AVTransport`
    pub id: String,
    pub service_type: String,
    /// UDN of the (sub-)device declaring the service
    pub device: String,
    pub control_url: Url,
    pub event_sub_url: Option<Url>,
    pub scpd_url: Url,
    pub state_variables: BTreeMap<String, StateVariable>,
    pub actions: BTreeMap<String, Action>,
}

impl Service {
    /// Whether `id` names this service, by full id or by its last segment
    pub fn matches(&self, id: &str) -> bool {
        self.id == id || self.id.rsplit(':').next() == Some(id)
    }
}

/// A described UPnP device
#[derive(Debug, Clone)]
pub struct UpnpDevice {
    info: DeviceInfo,
    location: Url,
    services: Vec<Service>,
    http: reqwest::Client,
}

impl UpnpDevice {
    /// Description URL of the HEOS player at `address`
    pub fn description_url(address: IpAddr) -> String {
        match address {
            IpAddr::V4(ip) => format!("http://{}:{}{}", ip, DESCRIPTION_PORT, DESCRIPTION_PATH),
            IpAddr::V6(ip) => format!("http://[{}]:{}{}", ip, DESCRIPTION_PORT, DESCRIPTION_PATH),
        }
    }

    /// Describe the HEOS player at `address`
    pub async fn connect(address: IpAddr, timeout: Duration) -> Result<Self> {
        Self::fetch(&Self::description_url(address), timeout).await
    }

    /// Load a device description and all of its service descriptions
    pub async fn fetch(location: &str, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()?;
        let location = Url::parse(location).map_err(|e| HeosError::InvalidResponse(e.to_string()))?;

        tracing::debug!("Fetching device description {}", location);
        let text = get_text(&http, &location).await?;
        let root: RootDoc = quick_xml::de::from_str(&text)?;

        let mut declared = Vec::new();
        collect_services(&root.device, &mut declared);

        let services = try_join_all(
            declared
                .into_iter()
                .map(|(udn, doc)| describe_service(&http, &location, udn, doc)),
        )
        .await?;

        let device = root.device;
        tracing::info!(
            "Described {} ({}) with {} services",
            device.friendly_name,
            device.model_name,
            services.len()
        );

        Ok(Self {
            info: DeviceInfo {
                device_type: device.device_type,
                friendly_name: device.friendly_name,
                manufacturer: device.manufacturer,
                model_name: device.model_name,
                model_number: device.model_number,
                serial_number: device.serial_number,
                udn: device.udn,
            },
            location,
            services,
            http,
        })
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    pub fn location(&self) -> &Url {
        &self.location
    }

    pub fn services(&self) -> &[Service] {
        &self.services
    }

    pub fn has_service(&self, id: &str) -> bool {
        self.services.iter().any(|s| s.matches(id))
    }

    pub fn service(&self, id: &str) -> Result<&Service> {
        self.services
            .iter()
            .find(|s| s.matches(id))
            .ok_or_else(|| HeosError::not_found("service", id))
    }

    pub fn actions(&self, service: &str) -> Result<Vec<&Action>> {
        Ok(self.service(service)?.actions.values().collect())
    }

    pub fn has_action(&self, service: &str, action: &str) -> bool {
        self.action(service, action).is_ok()
    }

    pub fn action(&self, service: &str, action: &str) -> Result<&Action> {
        self.service(service)?
            .actions
            .get(action)
            .ok_or_else(|| HeosError::not_found("action", format!("{}#{}", service, action)))
    }

    /// Invoke an action; unknown services and actions fail before any request
    pub async fn invoke(&self, service: &str, action: &str, args: &Map<String, Value>) -> Result<SoapResult> {
        let svc = self.service(service)?;
        let act = self.action(service, action)?;
        soap::invoke(&self.http, svc, act, args).await
    }
}

fn collect_services<'a>(device: &'a DeviceDoc, out: &mut Vec<(&'a str, &'a ServiceDoc)>) {
    if let Some(list) = &device.service_list {
        out.extend(list.services.iter().map(|s| (device.udn.as_str(), s)));
    }
    if let Some(list) = &device.device_list {
        for sub in &list.devices {
            collect_services(sub, out);
        }
    }
}

async fn get_text(http: &reqwest::Client, url: &Url) -> Result<String> {
    let response = http.get(url.clone()).send().await?;
    let status = response.status().as_u16();
    let body = response.text().await?;
    if status != 200 {
        return Err(HeosError::HttpStatus { status, body });
    }
    Ok(body)
}

fn absolute(base: &Url, url: &str) -> Result<Url> {
    base.join(url)
        .map_err(|e| HeosError::InvalidResponse(format!("Bad URL {}: {}", url, e)))
}

async fn describe_service(http: &reqwest::Client, base: &Url, udn: &str, doc: &ServiceDoc) -> Result<Service> {
    let scpd_url = absolute(base, &doc.scpd_url)?;
    let control_url = absolute(base, &doc.control_url)?;
    let event_sub_url = match doc.event_sub_url.as_deref().filter(|u| !u.is_empty()) {
        Some(url) => Some(absolute(base, url)?),
        None => None,
    };

    tracing::debug!("Fetching service description {}", scpd_url);
    let scpd: ScpdDoc = quick_xml::de::from_str(&get_text(http, &scpd_url).await?)?;
    let (state_variables, actions) = build_tables(scpd);

    Ok(Service {
        id: doc.service_id.clone(),
        service_type: doc.service_type.clone(),
        device: udn.to_string(),
        control_url,
        event_sub_url,
        scpd_url,
        state_variables,
        actions,
    })
}

fn build_tables(scpd: ScpdDoc) -> (BTreeMap<String, StateVariable>, BTreeMap<String, Action>) {
    let state_variables: BTreeMap<String, StateVariable> = scpd
        .state_table
        .map(|t| t.variables)
        .unwrap_or_default()
        .into_iter()
        .map(|v| {
            let variable = StateVariable {
                name: v.name.clone(),
                data_type: v.data_type,
                allowed_values: v.allowed_value_list.map(|l| l.values).unwrap_or_default(),
                send_events: v.send_events.as_deref() == Some("yes"),
            };
            (v.name, variable)
        })
        .collect();

    let actions = scpd
        .action_list
        .map(|l| l.actions)
        .unwrap_or_default()
        .into_iter()
        .map(|a| {
            let mut action = Action {
                name: a.name.clone(),
                inputs: Vec::new(),
                outputs: Vec::new(),
            };
            for arg in a.argument_list.map(|l| l.arguments).unwrap_or_default() {
                let related = state_variables.get(&arg.related_state_variable);
                let direction = if arg.direction.eq_ignore_ascii_case("out") {
                    Direction::Out
                } else {
                    Direction::In
                };
                let argument = Argument {
                    name: arg.name,
                    direction,
                    related_state_variable: arg.related_state_variable.clone(),
                    data_type: related.map(|v| v.data_type.clone()),
                    allowed_values: related.map(|v| v.allowed_values.clone()).unwrap_or_default(),
                };
                match direction {
                    Direction::In => action.inputs.push(argument),
                    Direction::Out => action.outputs.push(argument),
                }
            }
            (a.name, action)
        })
        .collect();

    (state_variables, actions)
}
