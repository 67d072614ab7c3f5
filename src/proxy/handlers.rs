use std::sync::Arc;

use axum::extract::{Request, State};
use axum::response::{IntoResponse, Response};

use super::inspect::Target;
use super::middleware::Admitted;
use super::scope::RequestScope;
use crate::AppState;
use crate::bridge::{self, Call};
use crate::error::AppError;
use crate::routes::{self, RouteRequest};

/// Pull what the governance layer attached to the request.
fn admitted(request: &mut Request) -> Result<(Arc<RequestScope>, Admitted), AppError> {
    let scope = request.extensions_mut().remove::<Arc<RequestScope>>();
    let admitted = request.extensions_mut().remove::<Admitted>();
    match (scope, admitted) {
        (Some(scope), Some(admitted)) => Ok((scope, admitted)),
        _ => Err(AppError::Internal("request was not admitted".into())),
    }
}

/// `ANY /api/providers/{provider}/{*rest}` and
/// `ANY /api/custom/providers/{provider}/{*rest}`
pub async fn proxy_handler(State(state): State<AppState>, mut request: Request) -> Response {
    match forward(&state, &mut request).await {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}

async fn forward(state: &AppState, request: &mut Request) -> Result<Response, AppError> {
    let (scope, admitted) = admitted(request)?;
    let (provider, rest) = match &admitted.target {
        Target::Provider { provider, rest } | Target::Custom { name: provider, rest } => {
            (provider.clone(), rest.clone())
        }
        _ => return Err(AppError::NotFound("not a provider path".into())),
    };

    let call = Call {
        scope,
        provider,
        setting: admitted.setting,
        method: request.method().clone(),
        path: rest,
        query: request.uri().query().map(str::to_string),
        headers: request.headers().clone(),
        body: admitted.body,
        json: admitted.json,
        multipart: admitted.multipart,
        model: admitted.inspection.model,
        stream: admitted.inspection.stream,
        prompt_tokens: admitted.inspection.prompt_tokens,
        route_config: admitted.route_config,
        auth_param: admitted
            .custom_provider
            .map(|cp| cp.authentication_param.clone())
            .unwrap_or_default(),
    };
    bridge::forward(&state.upstreams, call).await
}

/// `POST /api/routes/{*route}`
pub async fn route_handler(State(state): State<AppState>, mut request: Request) -> Response {
    let result = async {
        let (scope, admitted) = admitted(&mut request)?;
        let route = admitted
            .route
            .ok_or_else(|| AppError::NotFound("route not found".into()))?;
        let key = scope
            .key()
            .ok_or_else(|| AppError::Internal("admitted request has no key".into()))?;
        routes::execute(
            &state.upstreams,
            &state.mirror,
            RouteRequest {
                scope: &scope,
                key: &key,
                route: &route,
                headers: request.headers(),
                json: admitted.json.as_ref(),
            },
        )
        .await
    }
    .await;

    result.unwrap_or_else(IntoResponse::into_response)
}
